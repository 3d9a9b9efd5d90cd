//! History reconstruction from the store's versioned rows.
//!
//! Every versioned table holds one row per object version, valid over
//! `[_rev_min, _rev_max]`. The first version of an object is its creation,
//! each later version is an update at its `_rev_min`, and a closed last
//! version means the object was deleted at `_rev_max + 1`.
//!
//! The store is read in revision windows. Between windows only the latest
//! version of every live object is kept.

use super::dump::RawRow;
use crate::core::columns::decode_attributes;
use crate::core::schema::{COL_BRANCH, COL_ID, COL_REV_CREATE, COL_REV_MAX, COL_REV_MIN};
use crate::core::{
    AttributeChange, Attributes, BranchEvent, ChangeSet, CommitInfo, ItemDeletion, ItemUpdate,
    ObjectCreation, ObjectId, ObjectIdentity, Revision, SqlValue, TableRows, TypeDef,
    TypeDirectory, Value, REVISION_MAX, TRUNK,
};
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// One stored row version of a versioned object.
#[derive(Debug)]
struct Version {
    rev_min: Revision,
    rev_max: Revision,
    rev_create: Revision,
    values: Attributes,
}

/// Latest version of a live object.
#[derive(Debug)]
struct Live {
    rev_max: Revision,
    values: Attributes,
}

/// Builds change sets from the store's rows, one revision window at a time.
///
/// Windows must be fed in increasing order and cover every revision;
/// [`finish`](Self::finish) then emits what lies past the last window.
pub struct HistoryBuilder<'a> {
    types: &'a dyn TypeDirectory,
    live: HashMap<ObjectIdentity, Live>,
    /// Live objects by the revision their current version ends before.
    closing: BTreeMap<Revision, Vec<ObjectIdentity>>,
    branch_events: BTreeMap<Revision, Vec<BranchEvent>>,
    revisions: u64,
}

impl<'a> HistoryBuilder<'a> {
    pub fn new(types: &'a dyn TypeDirectory) -> Self {
        Self {
            types,
            live: HashMap::new(),
            closing: BTreeMap::new(),
            branch_events: BTreeMap::new(),
            revisions: 0,
        }
    }

    /// Number of change sets emitted so far.
    pub fn revisions(&self) -> u64 {
        self.revisions
    }

    /// Objects of an unversioned type.
    pub fn unversioned(&self, def: &TypeDef, rows: &TableRows) -> Result<Vec<ObjectCreation>> {
        let mut creations = Vec::with_capacity(rows.rows.len());
        for row in &rows.rows {
            let id = required_i64(rows, row, COL_ID)?;
            let values =
                decode_attributes(def, &rows.columns, row).map_err(|e| row_error(rows, id, e))?;
            creations.push(ObjectCreation {
                object: ObjectIdentity::new(TRUNK, def.name.clone(), id),
                values,
            });
        }
        Ok(creations)
    }

    /// Register the branch table. Each branch event is emitted with the
    /// revision the branch was created in.
    pub fn branches(&mut self, rows: &TableRows) -> Result<()> {
        for row in &rows.rows {
            let branch = required_i64(rows, row, "branch")?;
            if branch == TRUNK {
                continue;
            }
            let base_branch = optional_i64(rows, row, "base_branch")?.unwrap_or(TRUNK);
            let base_revision = optional_i64(rows, row, "base_rev")?.unwrap_or(0);
            let created = optional_i64(rows, row, "rev_create")?.unwrap_or(base_revision + 1);
            self.branch_events.entry(created).or_default().push(BranchEvent {
                branch,
                base_branch,
                base_revision,
            });
        }
        Ok(())
    }

    /// Change sets of every revision up to `upto` not emitted yet.
    ///
    /// `revisions` holds the revision rows of the window and `versions` the
    /// rows of each versioned type whose `_rev_min` falls in it.
    pub fn window(
        &mut self,
        upto: Revision,
        revisions: &TableRows,
        versions: &[(&TypeDef, TableRows)],
    ) -> Result<Vec<ChangeSet>> {
        let mut change_sets = commits(revisions)?;

        let mut rows = Vec::new();
        for (def, table) in versions {
            for row in &table.rows {
                rows.push(parse_version(def, table, row)?);
            }
        }
        rows.sort_by_key(|(o, v)| (v.rev_min, o.type_name.clone(), o.id, o.branch));
        for (object, version) in rows {
            self.apply(object, version, &mut change_sets)?;
        }

        let later = self.closing.split_off(&upto.saturating_add(1));
        let due = std::mem::replace(&mut self.closing, later);
        self.delete_closed(due, &mut change_sets);

        let later = self.branch_events.split_off(&upto.saturating_add(1));
        let due = std::mem::replace(&mut self.branch_events, later);
        for (revision, events) in due {
            ensure_revision(&mut change_sets, revision)
                .branch_events
                .extend(events);
        }

        Ok(self.emit(change_sets))
    }

    /// Change sets past the last window: deletions of versions closed at
    /// the last revision and branches created after it.
    pub fn finish(&mut self) -> Vec<ChangeSet> {
        let mut change_sets = BTreeMap::new();
        let due = std::mem::take(&mut self.closing);
        self.delete_closed(due, &mut change_sets);
        for (revision, events) in std::mem::take(&mut self.branch_events) {
            ensure_revision(&mut change_sets, revision)
                .branch_events
                .extend(events);
        }
        let out = self.emit(change_sets);
        info!(
            "Reconstructed {} revisions, {} objects live at the end",
            self.revisions,
            self.live.len()
        );
        out
    }

    fn apply(
        &mut self,
        object: ObjectIdentity,
        version: Version,
        change_sets: &mut BTreeMap<Revision, ChangeSet>,
    ) -> Result<()> {
        let rev_min = version.rev_min;
        if version.rev_max < rev_min {
            return Err(MigrateError::dump(
                0,
                format!(
                    "{}: version ends at r{} before it starts at r{}",
                    object, version.rev_max, rev_min
                ),
            ));
        }
        if let Some(live) = self.live.get(&object) {
            if live.rev_max != REVISION_MAX && live.rev_max + 1 < rev_min {
                warn!(
                    "{}: version gap between r{} and r{}, replayed as deletion",
                    object, live.rev_max, rev_min
                );
                let deleted_at = live.rev_max + 1;
                self.live.remove(&object);
                ensure_revision(change_sets, deleted_at)
                    .deletions
                    .push(ItemDeletion {
                        object: object.clone(),
                    });
            }
        }

        match self.live.get_mut(&object) {
            Some(live) => {
                if live.rev_max == REVISION_MAX || live.rev_max + 1 != rev_min {
                    warn!(
                        "{}: version at r{} overlaps the one ending at r{}",
                        object, rev_min, live.rev_max
                    );
                }
                let update = diff(&object, &live.values, &version.values);
                live.rev_max = version.rev_max;
                live.values = version.values;
                if update.changes.is_empty() {
                    debug!("{}: version at r{} changes nothing", object, rev_min);
                } else {
                    ensure_revision(change_sets, rev_min).merge_update(update);
                }
            }
            None => {
                if rev_min != version.rev_create {
                    warn!(
                        "{}: first version starts at r{} but object was created at r{}",
                        object, rev_min, version.rev_create
                    );
                }
                ensure_revision(change_sets, rev_min)
                    .creations
                    .push(ObjectCreation {
                        object: object.clone(),
                        values: version.values.clone(),
                    });
                self.live.insert(
                    object.clone(),
                    Live {
                        rev_max: version.rev_max,
                        values: version.values,
                    },
                );
            }
        }
        if version.rev_max != REVISION_MAX {
            self.closing
                .entry(version.rev_max + 1)
                .or_default()
                .push(object);
        }
        Ok(())
    }

    /// Delete objects whose version ends before the given revisions and
    /// has no successor.
    fn delete_closed(
        &mut self,
        due: BTreeMap<Revision, Vec<ObjectIdentity>>,
        change_sets: &mut BTreeMap<Revision, ChangeSet>,
    ) {
        for (revision, objects) in due {
            for object in objects {
                let ended = self.live.get(&object).is_some_and(|live| {
                    live.rev_max != REVISION_MAX && live.rev_max + 1 == revision
                });
                if ended {
                    self.live.remove(&object);
                    ensure_revision(change_sets, revision)
                        .deletions
                        .push(ItemDeletion { object });
                }
            }
        }
    }

    fn emit(&mut self, change_sets: BTreeMap<Revision, ChangeSet>) -> Vec<ChangeSet> {
        let mut out: Vec<ChangeSet> = change_sets.into_values().collect();
        for cs in &mut out {
            let by_type_and_id = |o: &ObjectIdentity| (o.type_name.clone(), o.id, o.branch);
            cs.creations.sort_by_key(|c| by_type_and_id(&c.object));
            cs.updates.sort_by_key(|u| by_type_and_id(&u.object));
            cs.deletions.sort_by_key(|d| by_type_and_id(&d.object));
            cs.branch_events.sort_by_key(|b| b.branch);
        }
        self.revisions += out.len() as u64;
        out
    }
}

/// Rows of a table outside the object model, as dump records.
pub fn raw_rows(rows: TableRows) -> impl Iterator<Item = RawRow> {
    let TableRows {
        table,
        columns,
        rows,
    } = rows;
    rows.into_iter().map(move |values| RawRow {
        table: table.clone(),
        columns: columns.clone(),
        values,
    })
}

/// Change sets of the revision rows, without events.
fn commits(rows: &TableRows) -> Result<BTreeMap<Revision, ChangeSet>> {
    let mut change_sets = BTreeMap::new();
    for row in &rows.rows {
        let revision = required_i64(rows, row, "rev")?;
        let millis = optional_i64(rows, row, "date")?.unwrap_or(0);
        let date = DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            MigrateError::dump(0, format!("revision {} has invalid date {}", revision, millis))
        })?;
        let commit = CommitInfo {
            author: optional_text(rows, row, "author").unwrap_or_default(),
            date,
            log: optional_text(rows, row, "log").unwrap_or_default(),
        };
        if change_sets
            .insert(revision, ChangeSet::new(revision, commit))
            .is_some()
        {
            return Err(MigrateError::dump(
                0,
                format!("revision {} appears twice in the revision table", revision),
            ));
        }
    }
    Ok(change_sets)
}

fn parse_version(
    def: &TypeDef,
    rows: &TableRows,
    row: &[SqlValue],
) -> Result<(ObjectIdentity, Version)> {
    let branch = required_i64(rows, row, COL_BRANCH)?;
    let id = required_i64(rows, row, COL_ID)?;
    let rev_min = required_i64(rows, row, COL_REV_MIN)?;
    let rev_max = optional_i64(rows, row, COL_REV_MAX)?.unwrap_or(REVISION_MAX);
    let rev_create = optional_i64(rows, row, COL_REV_CREATE)?.unwrap_or(rev_min);
    let values =
        decode_attributes(def, &rows.columns, row).map_err(|e| row_error(rows, id, e))?;
    Ok((
        ObjectIdentity::new(branch, def.name.clone(), id),
        Version {
            rev_min,
            rev_max,
            rev_create,
            values,
        },
    ))
}

/// Update turning `old` into `new`, listing changed attributes only.
fn diff(object: &ObjectIdentity, old: &Attributes, new: &Attributes) -> ItemUpdate {
    let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    let mut update = ItemUpdate::new(object.clone());
    for name in names {
        let before = old.get(name).cloned().unwrap_or(Value::Null);
        let after = new.get(name).cloned().unwrap_or(Value::Null);
        if before != after {
            update
                .changes
                .insert(name.clone(), AttributeChange::change(before, after));
        }
    }
    update
}

fn ensure_revision(
    change_sets: &mut BTreeMap<Revision, ChangeSet>,
    revision: Revision,
) -> &mut ChangeSet {
    change_sets.entry(revision).or_insert_with(|| {
        warn!("Revision {} has events but no revision row", revision);
        ChangeSet::new(
            revision,
            CommitInfo {
                author: String::new(),
                date: DateTime::<Utc>::UNIX_EPOCH,
                log: String::new(),
            },
        )
    })
}

fn cell<'r>(rows: &TableRows, row: &'r [SqlValue], column: &str) -> Option<&'r SqlValue> {
    rows.position(column).and_then(|i| row.get(i))
}

fn optional_i64(rows: &TableRows, row: &[SqlValue], column: &str) -> Result<Option<i64>> {
    match cell(rows, row, column) {
        None | Some(SqlValue::Null) => Ok(None),
        Some(SqlValue::I64(n)) => Ok(Some(*n)),
        Some(other) => Err(MigrateError::dump(
            0,
            format!("{}.{} must be an integer, got {:?}", rows.table, column, other),
        )),
    }
}

fn required_i64(rows: &TableRows, row: &[SqlValue], column: &str) -> Result<i64> {
    optional_i64(rows, row, column)?
        .ok_or_else(|| MigrateError::dump(0, format!("{}.{} is required", rows.table, column)))
}

fn optional_text(rows: &TableRows, row: &[SqlValue], column: &str) -> Option<String> {
    cell(rows, row, column).and_then(SqlValue::as_str).map(str::to_string)
}

fn row_error(rows: &TableRows, id: ObjectId, message: String) -> MigrateError {
    MigrateError::dump(0, format!("{} row {}: {}", rows.table, id, message))
}
