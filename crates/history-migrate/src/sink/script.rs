//! Script writer.
//!
//! Keeps the open row version of every live versioned object. A creation
//! opens `[r, MAX]`; an update closes the open version at `r - 1` and opens
//! the merged successor at `r`; a deletion closes it at `r - 1`. Closed
//! versions, branch rows, xref rows and revision rows are buffered per table
//! and flushed as chunked inserts, system tables first.
//!
//! Every reference written must name an object created somewhere in the
//! script; references left unresolved at the end are resolution errors.

use super::ScriptEntry;
use crate::core::columns::encode_attributes;
use crate::core::schema::{store_tables, BRANCH_TABLE, REVISION_TABLE, XREF_TABLE};
use crate::core::{
    Attributes, ChangeSet, ObjectCreation, ObjectId, ObjectIdentity, Revision, SqlValue,
    TableDef, TypeDirectory, Value, REVISION_MAX,
};
use crate::error::Result;
use crate::jsonl::{self, GzFileWriter};
use crate::report::{ErrorKind, ErrorLog};
use crate::source::RawRow;
use crate::target::sql::quote_ident;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Counters of a written script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptStats {
    pub revisions: u64,
    pub rows: u64,
    pub entries: u64,
    pub flushes: u64,
}

/// Result of a finished script.
#[derive(Debug, Clone, Default)]
pub struct ScriptSummary {
    pub stats: ScriptStats,
    pub errors: ErrorLog,
}

#[derive(Debug)]
struct OpenVersion {
    rev_min: Revision,
    rev_create: Revision,
    values: Attributes,
}

struct TableBuffer {
    def: TableDef,
    rows: Vec<Vec<SqlValue>>,
    written: bool,
}

/// Object key shared by all branches, as the id mapper keys objects.
type ObjectKey = (String, ObjectId);

/// First reference seen to an object not created yet.
struct PendingReference {
    revision: Option<Revision>,
    owner: ObjectIdentity,
    target: ObjectIdentity,
}

/// Turns the final event stream into a load script.
pub struct ScriptWriter<'a, W: Write> {
    types: &'a dyn TypeDirectory,
    out: W,
    open: BTreeMap<ObjectIdentity, OpenVersion>,
    tables: Vec<TableBuffer>,
    positions: HashMap<String, usize>,
    created: HashSet<ObjectKey>,
    dangling: BTreeMap<ObjectKey, PendingReference>,
    buffered: usize,
    buffer_size: usize,
    chunk_size: usize,
    errors: ErrorLog,
    stats: ScriptStats,
}

impl<'a> ScriptWriter<'a, GzFileWriter> {
    /// Create a gzip script file.
    pub fn create<P: AsRef<Path>>(
        path: P,
        types: &'a dyn TypeDirectory,
        buffer_size: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        Ok(Self::new(
            jsonl::create_gz(path)?,
            types,
            buffer_size,
            chunk_size,
        ))
    }

    /// Finish the script and close the file.
    pub fn close(self) -> Result<ScriptSummary> {
        let (out, summary) = self.finish()?;
        jsonl::finish_gz(out)?;
        Ok(summary)
    }
}

impl<'a, W: Write> ScriptWriter<'a, W> {
    pub fn new(
        out: W,
        types: &'a dyn TypeDirectory,
        buffer_size: usize,
        chunk_size: usize,
    ) -> Self {
        let tables: Vec<TableBuffer> = store_tables(types)
            .into_iter()
            .map(|def| TableBuffer {
                def,
                rows: Vec::new(),
                written: false,
            })
            .collect();
        let positions = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.def.name.clone(), i))
            .collect();
        Self {
            types,
            out,
            open: BTreeMap::new(),
            tables,
            positions,
            created: HashSet::new(),
            dangling: BTreeMap::new(),
            buffered: 0,
            buffer_size: buffer_size.max(1),
            chunk_size: chunk_size.max(1),
            errors: ErrorLog::new(),
            stats: ScriptStats::default(),
        }
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn stats(&self) -> &ScriptStats {
        &self.stats
    }

    /// Number of objects with an open row version.
    pub fn open_objects(&self) -> usize {
        self.open.len()
    }

    /// Apply one revision.
    pub fn write_change_set(&mut self, cs: ChangeSet) -> Result<()> {
        let r = cs.revision;
        self.stats.revisions += 1;

        for event in &cs.branch_events {
            self.push(
                BRANCH_TABLE,
                vec![
                    SqlValue::I64(event.branch),
                    SqlValue::I64(event.base_branch),
                    SqlValue::I64(event.base_revision),
                    SqlValue::I64(r),
                ],
            )?;
        }

        let touched: Vec<(i64, String)> = cs
            .touched_types()
            .into_iter()
            .map(|(branch, type_name)| (branch, type_name.to_string()))
            .collect();

        for creation in &cs.creations {
            self.note_created(&creation.object);
        }
        for creation in &cs.creations {
            self.check_references(Some(r), &creation.object, creation.values.values());
        }
        for update in &cs.updates {
            let values = update.changes.values().map(|c| &c.new);
            self.check_references(Some(r), &update.object, values);
        }

        for creation in cs.creations {
            if !self.check_type(&creation.object, r, true) {
                continue;
            }
            if self.open.contains_key(&creation.object) {
                self.errors.structural(
                    r,
                    format!("creation overrides existing object {}", creation.object),
                );
            }
            let mut values = creation.values;
            values.retain(|_, v| !v.is_null());
            self.open.insert(
                creation.object,
                OpenVersion {
                    rev_min: r,
                    rev_create: r,
                    values,
                },
            );
        }

        for update in cs.updates {
            let Some(current) = self.open.get_mut(&update.object) else {
                self.errors
                    .structural(r, format!("update of unknown object {}", update.object));
                continue;
            };
            let changes = update.changes.into_iter().map(|(k, c)| (k, c.new));
            if current.rev_min == r {
                apply_changes(&mut current.values, changes);
                continue;
            }
            let mut values = current.values.clone();
            apply_changes(&mut values, changes);
            let successor = OpenVersion {
                rev_min: r,
                rev_create: current.rev_create,
                values,
            };
            let closed = std::mem::replace(current, successor);
            self.close_version(&update.object, &closed, r - 1)?;
        }

        for deletion in cs.deletions {
            let Some(closed) = self.open.remove(&deletion.object) else {
                self.errors
                    .structural(r, format!("deletion of unknown object {}", deletion.object));
                continue;
            };
            if closed.rev_min > r - 1 {
                debug!("{} created and deleted in revision {}", deletion.object, r);
                continue;
            }
            self.close_version(&deletion.object, &closed, r - 1)?;
        }

        for (branch, type_name) in touched {
            self.push(
                XREF_TABLE,
                vec![
                    SqlValue::I64(r),
                    SqlValue::I64(branch),
                    SqlValue::Text(type_name),
                ],
            )?;
        }

        self.push(
            REVISION_TABLE,
            vec![
                SqlValue::I64(r),
                SqlValue::I64(cs.commit.date.timestamp_millis()),
                SqlValue::Text(cs.commit.author),
                SqlValue::Text(cs.commit.log),
            ],
        )
    }

    /// Write an object outside the revision model.
    pub fn write_unversioned(&mut self, creation: ObjectCreation) -> Result<()> {
        if !self.check_type(&creation.object, 0, false) {
            return Ok(());
        }
        self.note_created(&creation.object);
        self.check_references(None, &creation.object, creation.values.values());
        let Some(def) = self.types.lookup(&creation.object.type_name) else {
            return Ok(());
        };
        match encode_attributes(def, &creation.values) {
            Ok(cells) => {
                let mut row = vec![SqlValue::I64(creation.object.id)];
                row.extend(cells);
                let table = def.table_name().to_string();
                self.push(&table, row)
            }
            Err(message) => {
                self.errors.record(
                    ErrorKind::Structural,
                    None,
                    format!("{}: {}", creation.object, message),
                );
                Ok(())
            }
        }
    }

    /// Write a row of a table outside the object model.
    pub fn write_row(&mut self, raw: RawRow) -> Result<()> {
        let Some(def) = self.types.raw_tables().iter().find(|t| t.name == raw.table) else {
            self.errors.record(
                ErrorKind::Structural,
                None,
                format!("row for undeclared table {}", raw.table),
            );
            return Ok(());
        };
        if let Some(unknown) = raw.columns.iter().find(|c| def.column(c).is_none()) {
            self.errors.record(
                ErrorKind::Structural,
                None,
                format!("table {} has no column {}", raw.table, unknown),
            );
            return Ok(());
        }
        let row = def
            .columns
            .iter()
            .map(|column| {
                raw.columns
                    .iter()
                    .position(|c| *c == column.name)
                    .and_then(|i| raw.values.get(i).cloned())
                    .unwrap_or(SqlValue::Null)
            })
            .collect();
        let table = def.name.clone();
        self.push(&table, row)
    }

    /// Close every open version at `MAX`, flush, and hand back the output.
    pub fn finish(mut self) -> Result<(W, ScriptSummary)> {
        let open = std::mem::take(&mut self.open);
        for (object, version) in &open {
            self.close_version(object, version, REVISION_MAX)?;
        }
        self.flush()?;

        for pending in std::mem::take(&mut self.dangling).into_values() {
            self.errors.record(
                ErrorKind::Resolution,
                pending.revision,
                format!(
                    "{} references {}, which is never created",
                    pending.owner, pending.target
                ),
            );
        }

        let analyzed: Vec<String> = self
            .tables
            .iter()
            .filter(|t| t.written)
            .map(|t| t.def.name.clone())
            .collect();
        for table in analyzed {
            self.emit(ScriptEntry::Statement {
                sql: format!("ANALYZE {}", quote_ident(&table)),
            })?;
        }

        info!(
            "Script written: {} revisions, {} rows in {} entries",
            self.stats.revisions, self.stats.rows, self.stats.entries
        );
        Ok((
            self.out,
            ScriptSummary {
                stats: self.stats,
                errors: self.errors,
            },
        ))
    }

    /// Whether the object's type exists with the expected versioning.
    fn check_type(
        &mut self,
        object: &ObjectIdentity,
        revision: Revision,
        versioned: bool,
    ) -> bool {
        let message = match self.types.lookup(&object.type_name) {
            Some(def) if def.versioned == versioned => return true,
            Some(_) if versioned => format!("{} is not versioned", object.type_name),
            Some(_) => format!("{} is versioned", object.type_name),
            None => format!("unknown type {}", object.type_name),
        };
        let revision = versioned.then_some(revision);
        self.errors
            .record(ErrorKind::Structural, revision, format!("{}: {}", object, message));
        false
    }

    fn note_created(&mut self, object: &ObjectIdentity) {
        let key = (object.type_name.clone(), object.id);
        self.dangling.remove(&key);
        self.created.insert(key);
    }

    /// Remember references to objects not created so far.
    fn check_references<'v>(
        &mut self,
        revision: Option<Revision>,
        owner: &ObjectIdentity,
        values: impl Iterator<Item = &'v Value>,
    ) {
        for reference in values.filter_map(Value::as_reference) {
            let key = (reference.object.type_name.clone(), reference.object.id);
            if self.created.contains(&key) {
                continue;
            }
            self.dangling.entry(key).or_insert_with(|| PendingReference {
                revision,
                owner: owner.clone(),
                target: reference.object.clone(),
            });
        }
    }

    fn close_version(
        &mut self,
        object: &ObjectIdentity,
        version: &OpenVersion,
        rev_max: Revision,
    ) -> Result<()> {
        let Some(def) = self.types.lookup(&object.type_name) else {
            return Ok(());
        };
        let cells = match encode_attributes(def, &version.values) {
            Ok(cells) => cells,
            Err(message) => {
                self.errors
                    .structural(version.rev_min, format!("{}: {}", object, message));
                return Ok(());
            }
        };
        let mut row = vec![
            SqlValue::I64(object.branch),
            SqlValue::I64(object.id),
            SqlValue::I64(version.rev_min),
            SqlValue::I64(rev_max),
            SqlValue::I64(version.rev_create),
        ];
        row.extend(cells);
        let table = def.table_name().to_string();
        self.push(&table, row)
    }

    fn push(&mut self, table: &str, row: Vec<SqlValue>) -> Result<()> {
        let Some(&i) = self.positions.get(table) else {
            self.errors
                .record(ErrorKind::Structural, None, format!("unknown table {}", table));
            return Ok(());
        };
        self.tables[i].rows.push(row);
        self.buffered += 1;
        if self.buffered >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Write all buffered rows as chunked inserts.
    fn flush(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }
        debug!("Flushing {} buffered rows", self.buffered);
        for i in 0..self.tables.len() {
            let mut rows = std::mem::take(&mut self.tables[i].rows);
            if rows.is_empty() {
                continue;
            }
            self.tables[i].written = true;
            let table = self.tables[i].def.name.clone();
            let columns = self.tables[i].def.column_names();
            while !rows.is_empty() {
                let rest = rows.split_off(rows.len().min(self.chunk_size));
                self.stats.rows += rows.len() as u64;
                self.emit(ScriptEntry::Insert {
                    table: table.clone(),
                    columns: columns.clone(),
                    rows,
                })?;
                rows = rest;
            }
        }
        self.buffered = 0;
        self.stats.flushes += 1;
        Ok(())
    }

    fn emit(&mut self, entry: ScriptEntry) -> Result<()> {
        jsonl::write_line(&mut self.out, &entry)?;
        self.stats.entries += 1;
        Ok(())
    }
}

/// Apply new values; null removes the attribute.
fn apply_changes(values: &mut Attributes, changes: impl Iterator<Item = (String, Value)>) {
    for (name, value) in changes {
        if value.is_null() {
            values.remove(&name);
        } else {
            values.insert(name, value);
        }
    }
}
