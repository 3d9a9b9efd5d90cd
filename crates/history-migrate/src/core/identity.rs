//! Object identities, references, and revision numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A point in the store's history. Revisions are totally ordered.
pub type Revision = i64;

/// Local object identifier within a type.
pub type ObjectId = i64;

/// Branch identifier.
pub type BranchId = i64;

/// Upper bound used for open (still current) row versions.
pub const REVISION_MAX: Revision = i64::MAX;

/// The trunk branch.
pub const TRUNK: BranchId = 1;

/// Stable identity of an object: (branch, type, local id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity {
    pub branch: BranchId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub id: ObjectId,
}

impl ObjectIdentity {
    pub fn new(branch: BranchId, type_name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            branch,
            type_name: type_name.into(),
            id,
        }
    }

    /// Same object under a different local id.
    pub fn with_id(&self, id: ObjectId) -> Self {
        Self {
            branch: self.branch,
            type_name: self.type_name.clone(),
            id,
        }
    }

    /// Same object relocated to another type.
    pub fn with_type(&self, type_name: impl Into<String>) -> Self {
        Self {
            branch: self.branch,
            type_name: type_name.into(),
            id: self.id,
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.type_name, self.id, self.branch)
    }
}

/// Which version of the referenced object a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPosition {
    /// Always the latest version.
    Current,
    /// The version valid at the given revision.
    Revision(Revision),
}

impl HistoryPosition {
    /// Revision column encoding: `None` for current.
    pub fn as_revision(&self) -> Option<Revision> {
        match self {
            HistoryPosition::Current => None,
            HistoryPosition::Revision(rev) => Some(*rev),
        }
    }
}

/// An edge to another object, used as an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectReference {
    pub object: ObjectIdentity,
    pub position: HistoryPosition,
}

impl ObjectReference {
    /// Reference to the current version of an object.
    pub fn current(object: ObjectIdentity) -> Self {
        Self {
            object,
            position: HistoryPosition::Current,
        }
    }

    /// Same position, different target.
    pub fn retarget(&self, object: ObjectIdentity) -> Self {
        Self {
            object,
            position: self.position,
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            HistoryPosition::Current => write!(f, "{}", self.object),
            HistoryPosition::Revision(rev) => write!(f, "{}:r{}", self.object, rev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display() {
        let id = ObjectIdentity::new(TRUNK, "Person", 42);
        assert_eq!(id.to_string(), "Person#42@1");
    }

    #[test]
    fn test_reference_serde_keeps_position() {
        let reference = ObjectReference {
            object: ObjectIdentity::new(2, "Group", 7),
            position: HistoryPosition::Revision(12),
        };
        let json = serde_json::to_string(&reference).unwrap();
        assert!(json.contains("\"type\":\"Group\""));
        let back: ObjectReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }

    #[test]
    fn test_retarget_keeps_position() {
        let reference = ObjectReference::current(ObjectIdentity::new(1, "A", 1));
        let moved = reference.retarget(ObjectIdentity::new(1, "B", 9));
        assert_eq!(moved.position, HistoryPosition::Current);
        assert_eq!(moved.object.type_name, "B");
    }
}
