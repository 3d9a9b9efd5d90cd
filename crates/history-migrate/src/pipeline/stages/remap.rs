//! Identifier remapping.
//!
//! Gives every object of the remapped types a target id and rewrites every
//! reference and `Id` value accordingly. Creations are mapped before any
//! event of the revision is rewritten, so forward references inside one
//! revision resolve.
//!
//! With `reconcile`, a creation whose functional key is already owned by a
//! mapped object is folded into that object: its source id is aliased to the
//! owner's target id and every event of the folded object is dropped.

use crate::config::StageConfig;
use crate::core::{
    Attributes, ChangeSet, ItemDeletion, ItemUpdate, ObjectCreation, ObjectId, ObjectIdentity,
    Value,
};
use crate::error::Result;
use crate::index::{IndexHandle, SELF_ATTRIBUTE};
use crate::pipeline::registry::{reject_slot_filter, stage_params, BuildContext};
use crate::pipeline::stage::{Stage, StageContext};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
struct ReconcileRule {
    #[serde(rename = "type")]
    type_name: String,
    keys: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IdRemapParams {
    #[serde(default)]
    reconcile: Vec<ReconcileRule>,
}

struct Reconcile {
    keys: Vec<String>,
    index: IndexHandle,
}

pub struct IdRemap {
    /// Remapped types (empty: all).
    types: BTreeSet<String>,
    reconcile: BTreeMap<String, Reconcile>,
    /// Source ids folded into an existing object, on every branch.
    suppressed: HashSet<ObjectId>,
}

pub fn build_id_remap(config: &StageConfig, ctx: &mut BuildContext<'_>) -> Result<Box<dyn Stage>> {
    reject_slot_filter(config)?;
    for name in &config.types {
        ctx.require_type(name)?;
    }
    let params: IdRemapParams = stage_params(config)?;

    let mut reconcile = BTreeMap::new();
    for rule in params.reconcile {
        for key in &rule.keys {
            ctx.require_attribute(&rule.type_name, key)?;
        }
        let keys: Vec<&str> = rule.keys.iter().map(String::as_str).collect();
        let index = ctx
            .indexer
            .register(&rule.type_name, &keys, &[SELF_ATTRIBUTE])?;
        reconcile.insert(
            rule.type_name,
            Reconcile {
                keys: rule.keys,
                index,
            },
        );
    }

    Ok(Box::new(IdRemap {
        types: config.types.iter().cloned().collect(),
        reconcile,
        suppressed: HashSet::new(),
    }))
}

impl IdRemap {
    fn remaps(&self, type_name: &str) -> bool {
        self.types.is_empty() || self.types.contains(type_name)
    }

    fn is_suppressed(&self, object: &ObjectIdentity) -> bool {
        self.remaps(&object.type_name) && self.suppressed.contains(&object.id)
    }

    /// Map a creation, aliasing it onto an existing owner of its key.
    fn map_creation(&mut self, creation: &ObjectCreation, ctx: &mut StageContext<'_>) {
        let object = &creation.object;
        if ctx.mapper.map(object.id).is_some() {
            return;
        }
        if let Some(rule) = self.reconcile.get(&object.type_name) {
            let key: Vec<Value> = rule
                .keys
                .iter()
                .map(|k| creation.values.get(k).cloned().unwrap_or_default())
                .collect();
            if !key.iter().any(Value::is_null) {
                let existing = ctx
                    .indexer
                    .owners(rule.index, &key)
                    .into_iter()
                    .filter(|owner| *owner != object)
                    .find_map(|owner| {
                        ctx.mapper
                            .map(owner.id)
                            .map(|target| (owner.clone(), target))
                    });
                if let Some((owner, target)) = existing {
                    debug!("Reconciling {} with existing {}", object, owner);
                    match ctx.mapper.alias(object.id, target) {
                        Ok(()) => {
                            self.suppressed.insert(object.id);
                        }
                        Err(e) => ctx.resolution_error(e.to_string()),
                    }
                    return;
                }
            }
        }
        ctx.mapper.map_or_create(object.id);
    }

    /// Rewrite the object's own identity. `None` if it has no mapping.
    fn map_identity(
        &self,
        object: &ObjectIdentity,
        ctx: &StageContext<'_>,
    ) -> Option<ObjectIdentity> {
        if !self.remaps(&object.type_name) {
            return Some(object.clone());
        }
        ctx.mapper.map(object.id).map(|id| object.with_id(id))
    }

    /// Rewrite references and ids inside a value. Unresolvable values become null.
    fn map_value(&self, attribute: &str, value: &mut Value, ctx: &mut StageContext<'_>) {
        match value {
            Value::Reference(reference) if self.remaps(&reference.object.type_name) => {
                match ctx.mapper.map(reference.object.id) {
                    Some(id) => *reference = reference.retarget(reference.object.with_id(id)),
                    None => {
                        ctx.resolution_error(format!(
                            "attribute '{}' references unmapped {}",
                            attribute, reference.object
                        ));
                        *value = Value::Null;
                    }
                }
            }
            Value::Id(id) => match ctx.mapper.map(*id) {
                Some(target) => *id = target,
                None => {
                    ctx.resolution_error(format!(
                        "attribute '{}' holds unmapped id {}",
                        attribute, id
                    ));
                    *value = Value::Null;
                }
            },
            _ => {}
        }
    }

    fn map_values(&self, values: &mut Attributes, ctx: &mut StageContext<'_>) {
        for (name, value) in values.iter_mut() {
            self.map_value(name, value, ctx);
        }
    }

    /// Old values are informational: map what resolves, keep the rest.
    fn map_old_value(&self, value: &mut Value, ctx: &StageContext<'_>) {
        match value {
            Value::Reference(reference) if self.remaps(&reference.object.type_name) => {
                if let Some(id) = ctx.mapper.map(reference.object.id) {
                    *reference = reference.retarget(reference.object.with_id(id));
                }
            }
            Value::Id(id) => {
                if let Some(target) = ctx.mapper.map(*id) {
                    *id = target;
                }
            }
            _ => {}
        }
    }
}

impl Stage for IdRemap {
    fn name(&self) -> &str {
        "id-remap"
    }

    fn queries_index(&self) -> bool {
        !self.reconcile.is_empty()
    }

    fn rewrites_identity(&self) -> bool {
        true
    }

    fn filtered(&self) -> bool {
        false
    }

    fn begin_revision(&mut self, input: &ChangeSet, ctx: &mut StageContext<'_>) -> Result<()> {
        for creation in &input.creations {
            if self.remaps(&creation.object.type_name) {
                self.map_creation(creation, ctx);
            }
        }
        Ok(())
    }

    fn creation(
        &mut self,
        mut event: ObjectCreation,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if self.is_suppressed(&event.object) {
            return Ok(());
        }
        if self.remaps(&event.object.type_name) {
            // Unversioned objects arrive without a begin_revision.
            let id = ctx.mapper.map_or_create(event.object.id);
            event.object = event.object.with_id(id);
        }
        self.map_values(&mut event.values, ctx);
        out.push_creation(event);
        Ok(())
    }

    fn update(
        &mut self,
        mut event: ItemUpdate,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if self.is_suppressed(&event.object) {
            return Ok(());
        }
        let Some(object) = self.map_identity(&event.object, ctx) else {
            ctx.resolution_error(format!("update of unmapped {}", event.object));
            return Ok(());
        };
        event.object = object;
        for (name, change) in event.changes.iter_mut() {
            self.map_value(name, &mut change.new, ctx);
            if let Some(old) = change.old.as_mut() {
                self.map_old_value(old, ctx);
            }
        }
        out.merge_update(event);
        Ok(())
    }

    fn deletion(
        &mut self,
        event: ItemDeletion,
        out: &mut ChangeSet,
        ctx: &mut StageContext<'_>,
    ) -> Result<()> {
        if self.is_suppressed(&event.object) {
            return Ok(());
        }
        match self.map_identity(&event.object, ctx) {
            Some(object) => out.deletions.push(ItemDeletion { object }),
            None => ctx.resolution_error(format!("deletion of unmapped {}", event.object)),
        }
        Ok(())
    }
}
