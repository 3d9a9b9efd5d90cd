//! Event model: one revision's worth of changes.

use super::identity::{BranchId, ObjectIdentity, Revision};
use super::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute name to value.
pub type Attributes = BTreeMap<String, Value>;

/// Creation of a new object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCreation {
    pub object: ObjectIdentity,
    #[serde(default)]
    pub values: Attributes,
}

/// A single attribute set inside an update.
///
/// `old` is the value before the change when known. A change with
/// `new == old` is an explicit no-op set and is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub new: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl AttributeChange {
    pub fn set(new: Value) -> Self {
        Self { new, old: None }
    }

    pub fn change(old: Value, new: Value) -> Self {
        Self {
            new,
            old: Some(old),
        }
    }
}

/// Update of an existing object. Attributes not present are unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemUpdate {
    pub object: ObjectIdentity,
    #[serde(default)]
    pub changes: BTreeMap<String, AttributeChange>,
}

impl ItemUpdate {
    pub fn new(object: ObjectIdentity) -> Self {
        Self {
            object,
            changes: BTreeMap::new(),
        }
    }

    pub fn with_change(mut self, attribute: impl Into<String>, change: AttributeChange) -> Self {
        self.changes.insert(attribute.into(), change);
        self
    }

    /// Fold a later update of the same object into this one.
    /// The original `old` value survives, the later `new` value wins.
    pub fn merge(&mut self, later: ItemUpdate) {
        for (attribute, change) in later.changes {
            match self.changes.get_mut(&attribute) {
                Some(existing) => existing.new = change.new,
                None => {
                    self.changes.insert(attribute, change);
                }
            }
        }
    }
}

/// Deletion of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDeletion {
    pub object: ObjectIdentity,
}

/// Creation of a branch from a base branch at a base revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEvent {
    pub branch: BranchId,
    pub base_branch: BranchId,
    pub base_revision: Revision,
}

/// Commit metadata of a revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub author: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub log: String,
}

/// One revision's payload.
///
/// All events carry the revision number of the change set that holds them.
/// At most one update per object is kept; further updates merge into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub revision: Revision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_events: Vec<BranchEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creations: Vec<ObjectCreation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<ItemUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletions: Vec<ItemDeletion>,
    pub commit: CommitInfo,
}

impl ChangeSet {
    pub fn new(revision: Revision, commit: CommitInfo) -> Self {
        Self {
            revision,
            branch_events: Vec::new(),
            creations: Vec::new(),
            updates: Vec::new(),
            deletions: Vec::new(),
            commit,
        }
    }

    /// A change set with the same revision and commit but no events.
    pub fn empty_like(&self) -> Self {
        Self::new(self.revision, self.commit.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.branch_events.is_empty()
            && self.creations.is_empty()
            && self.updates.is_empty()
            && self.deletions.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.branch_events.len() + self.creations.len() + self.updates.len() + self.deletions.len()
    }

    /// Add a creation, absorbing an update of the same object already queued.
    pub fn push_creation(&mut self, mut creation: ObjectCreation) {
        if let Some(pos) = self.updates.iter().position(|u| u.object == creation.object) {
            let update = self.updates.remove(pos);
            for (attribute, change) in update.changes {
                creation.values.insert(attribute, change.new);
            }
        }
        self.creations.push(creation);
    }

    /// Merge an update into this change set.
    ///
    /// Folds into a creation of the same object if present, else into an
    /// existing update of the same object, else appends.
    pub fn merge_update(&mut self, update: ItemUpdate) {
        if let Some(creation) = self
            .creations
            .iter_mut()
            .find(|c| c.object == update.object)
        {
            for (attribute, change) in update.changes {
                creation.values.insert(attribute, change.new);
            }
            return;
        }
        match self.updates.iter_mut().find(|u| u.object == update.object) {
            Some(existing) => existing.merge(update),
            None => self.updates.push(update),
        }
    }

    /// Net a later change set into this one.
    ///
    /// A creation followed by updates stays a creation; a creation followed by
    /// a deletion vanishes; an update followed by a deletion becomes a deletion.
    pub fn absorb(&mut self, later: ChangeSet) {
        self.branch_events.extend(later.branch_events);
        for creation in later.creations {
            self.push_creation(creation);
        }
        for update in later.updates {
            self.merge_update(update);
        }
        for deletion in later.deletions {
            if let Some(pos) = self.creations.iter().position(|c| c.object == deletion.object) {
                self.creations.remove(pos);
                continue;
            }
            self.updates.retain(|u| u.object != deletion.object);
            self.deletions.push(deletion);
        }
    }

    /// Objects deleted in this revision.
    pub fn deleted_objects(&self) -> BTreeSet<&ObjectIdentity> {
        self.deletions.iter().map(|d| &d.object).collect()
    }

    /// Distinct (branch, type) pairs touched by object events.
    pub fn touched_types(&self) -> BTreeSet<(BranchId, &str)> {
        let creations = self.creations.iter().map(|c| &c.object);
        let updates = self.updates.iter().map(|u| &u.object);
        let deletions = self.deletions.iter().map(|d| &d.object);
        creations
            .chain(updates)
            .chain(deletions)
            .map(|o| (o.branch, o.type_name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn commit(log: &str) -> CommitInfo {
        CommitInfo {
            author: "root".into(),
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            log: log.into(),
        }
    }

    fn person(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Person", id)
    }

    #[test]
    fn test_merge_update_keeps_original_old_value() {
        let mut cs = ChangeSet::new(5, commit("x"));
        cs.merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("A"), Value::text("B")),
        ));
        cs.merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("B"), Value::text("C")),
        ));

        assert_eq!(cs.updates.len(), 1);
        let change = &cs.updates[0].changes["name"];
        assert_eq!(change.old, Some(Value::text("A")));
        assert_eq!(change.new, Value::text("C"));
    }

    #[test]
    fn test_merge_update_keeps_no_op_set() {
        let mut cs = ChangeSet::new(5, commit("x"));
        cs.merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("A"), Value::text("B")),
        ));
        cs.merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("B"), Value::text("A")),
        ));

        let change = &cs.updates[0].changes["name"];
        assert_eq!(change.old.as_ref(), Some(&change.new));
    }

    #[test]
    fn test_merge_update_folds_into_creation() {
        let mut cs = ChangeSet::new(5, commit("x"));
        cs.push_creation(ObjectCreation {
            object: person(1),
            values: Attributes::from([("name".to_string(), Value::text("A"))]),
        });
        cs.merge_update(
            ItemUpdate::new(person(1)).with_change("name", AttributeChange::set(Value::text("B"))),
        );
        assert!(cs.updates.is_empty());
        assert_eq!(cs.creations[0].values["name"], Value::text("B"));
    }

    #[test]
    fn test_push_creation_absorbs_queued_update() {
        let mut cs = ChangeSet::new(5, commit("x"));
        cs.merge_update(
            ItemUpdate::new(person(1)).with_change("owner", AttributeChange::set(Value::Int(3))),
        );
        cs.push_creation(ObjectCreation {
            object: person(1),
            values: Attributes::new(),
        });
        assert!(cs.updates.is_empty());
        assert_eq!(cs.creations[0].values["owner"], Value::Int(3));
    }

    #[test]
    fn test_absorb_nets_creation_and_deletion() {
        let mut merged = ChangeSet::new(1, commit("a"));
        merged.push_creation(ObjectCreation {
            object: person(1),
            values: Attributes::new(),
        });
        merged.merge_update(
            ItemUpdate::new(person(2)).with_change("name", AttributeChange::set(Value::text("x"))),
        );

        let mut later = ChangeSet::new(2, commit("b"));
        later.deletions.push(ItemDeletion { object: person(1) });
        later.deletions.push(ItemDeletion { object: person(2) });
        merged.absorb(later);

        assert!(merged.creations.is_empty());
        assert!(merged.updates.is_empty());
        assert_eq!(merged.deletions, vec![ItemDeletion { object: person(2) }]);
    }

    #[test]
    fn test_touched_types() {
        let mut cs = ChangeSet::new(1, commit(""));
        cs.push_creation(ObjectCreation {
            object: person(1),
            values: Attributes::new(),
        });
        cs.deletions.push(ItemDeletion {
            object: ObjectIdentity::new(2, "Group", 1),
        });
        let touched: Vec<_> = cs.touched_types().into_iter().collect();
        assert_eq!(touched, vec![(1, "Person"), (2, "Group")]);
    }
}
