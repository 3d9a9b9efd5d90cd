//! Attribute indexer.
//!
//! An index maps the values of declared key attributes of one type to the
//! owning objects and a tuple of declared value attributes. Indexes are fed
//! the input of every revision before the stage chain sees it.
//!
//! Deletions are applied one revision late: an object deleted in revision
//! `r` stays visible to every lookup made while `r` is processed, and is gone
//! once `r + 1` begins. The driver calls, exactly once per revision:
//!
//! 1. [`Indexer::begin_revision`] - drops objects deleted in the previous revision
//! 2. [`Indexer::observe`] - applies creations and updates, buffers deletions
//! 3. (stage chain)
//! 4. [`Indexer::record_pending_deletes`] - hands buffered deletions to step 1

use crate::core::value::key_of;
use crate::core::{ChangeSet, ItemUpdate, KeyPart, ObjectCreation, ObjectIdentity, Value};
use crate::error::{MigrateError, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Pseudo attribute naming the object itself.
pub const SELF_ATTRIBUTE: &str = "_self";

/// Handle of a registered index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexHandle(usize);

/// One owner of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub object: ObjectIdentity,
    pub values: Vec<Value>,
}

#[derive(Debug)]
struct Tracked {
    key: Vec<KeyPart>,
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct AttributeIndex {
    type_name: String,
    key_attributes: Vec<String>,
    value_attributes: Vec<String>,
    buckets: HashMap<Vec<KeyPart>, Vec<IndexEntry>>,
    tracked: HashMap<ObjectIdentity, Tracked>,
}

impl AttributeIndex {
    fn name(&self) -> String {
        format!(
            "{}[{}]->[{}]",
            self.type_name,
            self.key_attributes.join(","),
            self.value_attributes.join(",")
        )
    }

    fn is_tracked_attribute(&self, name: &str) -> bool {
        self.key_attributes.iter().any(|a| a == name)
            || self.value_attributes.iter().any(|a| a == name)
    }

    fn resolve(object: &ObjectIdentity, attributes: &BTreeMap<String, Value>, name: &str) -> Value {
        if name == SELF_ATTRIBUTE {
            return Value::reference(object.clone());
        }
        attributes.get(name).cloned().unwrap_or_default()
    }

    fn project(
        &self,
        object: &ObjectIdentity,
        attributes: &BTreeMap<String, Value>,
    ) -> (Vec<KeyPart>, Vec<Value>) {
        let key: Vec<Value> = self
            .key_attributes
            .iter()
            .map(|a| Self::resolve(object, attributes, a))
            .collect();
        let values = self
            .value_attributes
            .iter()
            .map(|a| Self::resolve(object, attributes, a))
            .collect();
        (key_of(&key), values)
    }

    fn insert(&mut self, object: &ObjectIdentity, attributes: BTreeMap<String, Value>) {
        let (key, values) = self.project(object, &attributes);
        self.buckets.entry(key.clone()).or_default().push(IndexEntry {
            object: object.clone(),
            values,
        });
        self.tracked.insert(object.clone(), Tracked { key, attributes });
    }

    fn remove(&mut self, object: &ObjectIdentity) {
        if let Some(tracked) = self.tracked.remove(object) {
            self.remove_from_bucket(&tracked.key, object);
        }
    }

    fn remove_from_bucket(&mut self, key: &[KeyPart], object: &ObjectIdentity) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.retain(|e| &e.object != object);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
    }

    fn on_create(&mut self, creation: &ObjectCreation) {
        self.remove(&creation.object);
        let attributes = creation
            .values
            .iter()
            .filter(|(name, _)| self.is_tracked_attribute(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        self.insert(&creation.object, attributes);
    }

    fn on_update(&mut self, update: &ItemUpdate) {
        let Some(Tracked {
            key: old_key,
            mut attributes,
        }) = self.tracked.remove(&update.object)
        else {
            trace!("Index {}: update of untracked {}", self.name(), update.object);
            return;
        };

        let mut relevant = false;
        for (name, change) in &update.changes {
            if self.is_tracked_attribute(name) {
                attributes.insert(name.clone(), change.new.clone());
                relevant = true;
            }
        }
        if !relevant {
            self.tracked.insert(
                update.object.clone(),
                Tracked {
                    key: old_key,
                    attributes,
                },
            );
            return;
        }

        let (key, values) = self.project(&update.object, &attributes);
        if key == old_key {
            if let Some(entry) = self
                .buckets
                .get_mut(&key)
                .and_then(|b| b.iter_mut().find(|e| e.object == update.object))
            {
                entry.values = values;
            }
            self.tracked
                .insert(update.object.clone(), Tracked { key, attributes });
        } else {
            self.remove_from_bucket(&old_key, &update.object);
            self.insert(&update.object, attributes);
        }
    }

    fn entries(&self, key: &[Value]) -> &[IndexEntry] {
        self.buckets
            .get(&key_of(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Registry and maintainer of all indexes of a run.
#[derive(Debug, Default)]
pub struct Indexer {
    indexes: Vec<AttributeIndex>,
    by_type: HashMap<String, Vec<usize>>,
    revision_deletes: Vec<ObjectIdentity>,
    pending: Vec<ObjectIdentity>,
    started: bool,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index. Must happen before the first revision begins.
    /// Registering the same combination twice returns the same handle.
    pub fn register(
        &mut self,
        type_name: &str,
        key_attributes: &[&str],
        value_attributes: &[&str],
    ) -> Result<IndexHandle> {
        if self.started {
            return Err(MigrateError::Config(format!(
                "index on {} registered after processing started",
                type_name
            )));
        }
        if key_attributes.is_empty() {
            return Err(MigrateError::Config(format!(
                "index on {} needs at least one key attribute",
                type_name
            )));
        }

        let existing = self.indexes.iter().position(|ix| {
            ix.type_name == type_name
                && ix.key_attributes.iter().map(String::as_str).eq(key_attributes.iter().copied())
                && ix
                    .value_attributes
                    .iter()
                    .map(String::as_str)
                    .eq(value_attributes.iter().copied())
        });
        if let Some(pos) = existing {
            return Ok(IndexHandle(pos));
        }

        let index = AttributeIndex {
            type_name: type_name.to_string(),
            key_attributes: key_attributes.iter().map(|s| s.to_string()).collect(),
            value_attributes: value_attributes.iter().map(|s| s.to_string()).collect(),
            buckets: HashMap::new(),
            tracked: HashMap::new(),
        };
        debug!("Registered index {}", index.name());
        self.indexes.push(index);
        let handle = self.indexes.len() - 1;
        self.by_type
            .entry(type_name.to_string())
            .or_default()
            .push(handle);
        Ok(IndexHandle(handle))
    }

    /// Number of registered indexes.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Start a revision: objects deleted in the previous revision disappear.
    pub fn begin_revision(&mut self) {
        self.started = true;
        for object in std::mem::take(&mut self.pending) {
            if let Some(handles) = self.by_type.get(&object.type_name) {
                for &h in handles {
                    self.indexes[h].remove(&object);
                }
            }
        }
    }

    /// Apply a revision's creations and updates; buffer its deletions.
    pub fn observe(&mut self, changes: &ChangeSet) {
        if self.indexes.is_empty() {
            return;
        }
        for creation in &changes.creations {
            if let Some(handles) = self.by_type.get(&creation.object.type_name) {
                for &h in handles {
                    self.indexes[h].on_create(creation);
                }
            }
        }
        for update in &changes.updates {
            if let Some(handles) = self.by_type.get(&update.object.type_name) {
                for &h in handles {
                    self.indexes[h].on_update(update);
                }
            }
        }
        for deletion in &changes.deletions {
            if self.by_type.contains_key(&deletion.object.type_name) {
                self.revision_deletes.push(deletion.object.clone());
            }
        }
    }

    /// End of revision: deletions seen so far become due at the next begin.
    pub fn record_pending_deletes(&mut self) {
        self.pending.append(&mut self.revision_deletes);
    }

    /// Value tuple of the single owner of `key`; `None` if absent or shared.
    pub fn get(&self, handle: IndexHandle, key: &[Value]) -> Option<&[Value]> {
        match self.indexes[handle.0].entries(key) {
            [single] => Some(single.values.as_slice()),
            _ => None,
        }
    }

    /// Value tuples of all owners of `key`.
    pub fn get_all(&self, handle: IndexHandle, key: &[Value]) -> Vec<&[Value]> {
        self.indexes[handle.0]
            .entries(key)
            .iter()
            .map(|e| e.values.as_slice())
            .collect()
    }

    /// Owners of `key` with their value tuples.
    pub fn entries(&self, handle: IndexHandle, key: &[Value]) -> &[IndexEntry] {
        self.indexes[handle.0].entries(key)
    }

    /// Identities holding `key`.
    pub fn owners(&self, handle: IndexHandle, key: &[Value]) -> Vec<&ObjectIdentity> {
        self.indexes[handle.0]
            .entries(key)
            .iter()
            .map(|e| &e.object)
            .collect()
    }

    /// First value attribute of the owner of `key`.
    ///
    /// Errors if more than one object owns the key.
    pub fn get_single_value(&self, handle: IndexHandle, key: &[Value]) -> Result<Option<&Value>> {
        let index = &self.indexes[handle.0];
        match index.entries(key) {
            [] => Ok(None),
            [single] => Ok(single.values.first()),
            _ => Err(MigrateError::Ambiguous {
                index: index.name(),
                key: key
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
            }),
        }
    }

    /// Human readable index description for log messages.
    pub fn describe(&self, handle: IndexHandle) -> String {
        self.indexes[handle.0].name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeChange, Attributes, CommitInfo, ItemDeletion, Revision};
    use chrono::Utc;

    fn changes(revision: Revision) -> ChangeSet {
        ChangeSet::new(
            revision,
            CommitInfo {
                author: "test".into(),
                date: Utc::now(),
                log: String::new(),
            },
        )
    }

    fn person(id: i64) -> ObjectIdentity {
        ObjectIdentity::new(1, "Person", id)
    }

    fn create_person(cs: &mut ChangeSet, id: i64, ssn: &str, name: &str) {
        cs.push_creation(ObjectCreation {
            object: person(id),
            values: Attributes::from([
                ("ssn".to_string(), Value::text(ssn)),
                ("name".to_string(), Value::text(name)),
            ]),
        });
    }

    /// Run one revision through the indexer with a probe in the middle.
    fn process<F: FnOnce(&Indexer)>(indexer: &mut Indexer, cs: &ChangeSet, probe: F) {
        indexer.begin_revision();
        indexer.observe(cs);
        probe(indexer);
        indexer.record_pending_deletes();
    }

    #[test]
    fn test_person_ssn_lookup_follows_updates() {
        let mut indexer = Indexer::new();
        let ssn = indexer.register("Person", &["ssn"], &["name"]).unwrap();

        let mut r1 = changes(1);
        create_person(&mut r1, 1, "123", "A");
        process(&mut indexer, &r1, |ix| {
            assert_eq!(ix.get(ssn, &[Value::text("123")]), Some(&[Value::text("A")][..]));
        });

        let mut r2 = changes(2);
        r2.merge_update(ItemUpdate::new(person(1)).with_change(
            "name",
            AttributeChange::change(Value::text("A"), Value::text("B")),
        ));
        process(&mut indexer, &r2, |_| {});

        assert_eq!(
            indexer.get(ssn, &[Value::text("123")]),
            Some(&[Value::text("B")][..])
        );
    }

    #[test]
    fn test_key_change_moves_entry() {
        let mut indexer = Indexer::new();
        let ssn = indexer.register("Person", &["ssn"], &["name"]).unwrap();

        let mut r1 = changes(1);
        create_person(&mut r1, 1, "123", "A");
        process(&mut indexer, &r1, |_| {});

        let mut r2 = changes(2);
        r2.merge_update(
            ItemUpdate::new(person(1)).with_change("ssn", AttributeChange::set(Value::text("999"))),
        );
        process(&mut indexer, &r2, |_| {});

        assert!(indexer.get(ssn, &[Value::text("123")]).is_none());
        assert_eq!(
            indexer.get(ssn, &[Value::text("999")]),
            Some(&[Value::text("A")][..])
        );
    }

    #[test]
    fn test_deleted_object_visible_until_next_revision() {
        let mut indexer = Indexer::new();
        let ssn = indexer.register("Person", &["ssn"], &["name"]).unwrap();

        let mut r1 = changes(1);
        create_person(&mut r1, 1, "123", "A");
        process(&mut indexer, &r1, |_| {});

        let mut r2 = changes(2);
        r2.deletions.push(ItemDeletion { object: person(1) });
        process(&mut indexer, &r2, |ix| {
            assert_eq!(ix.get(ssn, &[Value::text("123")]), Some(&[Value::text("A")][..]));
        });

        process(&mut indexer, &changes(3), |ix| {
            assert!(ix.get(ssn, &[Value::text("123")]).is_none());
        });
    }

    #[test]
    fn test_shared_key_and_single_value() {
        let mut indexer = Indexer::new();
        let by_name = indexer.register("Person", &["name"], &["ssn"]).unwrap();

        let mut r1 = changes(1);
        create_person(&mut r1, 1, "111", "Smith");
        create_person(&mut r1, 2, "222", "Smith");
        create_person(&mut r1, 3, "333", "Jones");
        process(&mut indexer, &r1, |_| {});

        let smiths = indexer.get_all(by_name, &[Value::text("Smith")]);
        assert_eq!(smiths.len(), 2);
        assert!(indexer.get(by_name, &[Value::text("Smith")]).is_none());
        assert!(matches!(
            indexer.get_single_value(by_name, &[Value::text("Smith")]),
            Err(MigrateError::Ambiguous { .. })
        ));
        assert_eq!(
            indexer
                .get_single_value(by_name, &[Value::text("Jones")])
                .unwrap(),
            Some(&Value::text("333"))
        );
        assert_eq!(
            indexer
                .get_single_value(by_name, &[Value::text("Nobody")])
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_self_key_lookup() {
        let mut indexer = Indexer::new();
        let by_self = indexer
            .register("Person", &[SELF_ATTRIBUTE], &["name", SELF_ATTRIBUTE])
            .unwrap();

        let mut r1 = changes(1);
        create_person(&mut r1, 7, "777", "Seven");
        process(&mut indexer, &r1, |_| {});

        let values = indexer
            .get(by_self, &[Value::reference(person(7))])
            .unwrap();
        assert_eq!(values[0], Value::text("Seven"));
        assert_eq!(values[1], Value::reference(person(7)));
    }

    #[test]
    fn test_register_is_deduplicated_and_closed_after_start() {
        let mut indexer = Indexer::new();
        let a = indexer.register("Person", &["ssn"], &["name"]).unwrap();
        let b = indexer.register("Person", &["ssn"], &["name"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(indexer.len(), 1);

        indexer.begin_revision();
        assert!(matches!(
            indexer.register("Person", &["name"], &[]),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_other_types_ignored() {
        let mut indexer = Indexer::new();
        let ssn = indexer.register("Person", &["ssn"], &["name"]).unwrap();

        let mut r1 = changes(1);
        r1.push_creation(ObjectCreation {
            object: ObjectIdentity::new(1, "Robot", 1),
            values: Attributes::from([("ssn".to_string(), Value::text("123"))]),
        });
        process(&mut indexer, &r1, |_| {});
        assert!(indexer.get(ssn, &[Value::text("123")]).is_none());
    }
}
