//! Source to target identifier mapping.
//!
//! Keyed by source local id only, so the same object created on two branches
//! resolves to one target id. Entries never change once written.

use crate::core::ObjectId;
use crate::error::{MigrateError, Result};
use std::collections::HashMap;
use tracing::debug;

/// Run-scoped identifier mapper.
#[derive(Debug)]
pub struct IdMapper {
    mapping: HashMap<ObjectId, ObjectId>,
    next: ObjectId,
    allocated: u64,
}

impl IdMapper {
    /// Create a mapper allocating fresh ids from `start`.
    pub fn new(start: ObjectId) -> Self {
        Self {
            mapping: HashMap::new(),
            next: start,
            allocated: 0,
        }
    }

    /// Pure lookup.
    pub fn map(&self, source: ObjectId) -> Option<ObjectId> {
        self.mapping.get(&source).copied()
    }

    /// Existing mapping, or a freshly allocated one.
    pub fn map_or_create(&mut self, source: ObjectId) -> ObjectId {
        if let Some(&target) = self.mapping.get(&source) {
            return target;
        }
        let target = self.next;
        self.next += 1;
        self.allocated += 1;
        self.mapping.insert(source, target);
        target
    }

    /// Map `source` onto an already existing target id.
    pub fn alias(&mut self, source: ObjectId, target: ObjectId) -> Result<()> {
        match self.mapping.get(&source) {
            Some(&existing) if existing == target => Ok(()),
            Some(&existing) => Err(MigrateError::Resolution(format!(
                "id {} is already mapped to {}, cannot alias to {}",
                source, existing, target
            ))),
            None => {
                debug!("Aliasing source id {} to existing target id {}", source, target);
                self.mapping.insert(source, target);
                Ok(())
            }
        }
    }

    /// Number of mapped source ids.
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Number of fresh ids handed out.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }
}
