//! In-process store, used for dry runs against a captured snapshot and for
//! tests.

use super::{ColumnStats, HistoryRead, RowRange, TargetStore, TargetTransaction};
use crate::core::{SqlValue, TableDef, TableRows};
use crate::error::{MigrateError, Result};
use crate::source::StoreSnapshot;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Committed contents of a [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub tables: BTreeMap<String, TableRows>,
    /// Statements passed to `execute`, in commit order.
    pub executed: Vec<String>,
}

/// Store held in memory. Transactions work on a copy of the committed state
/// and replace it on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    failing: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the tables of a snapshot.
    pub fn with_snapshot(snapshot: StoreSnapshot) -> Self {
        let tables = snapshot
            .tables
            .into_iter()
            .map(|t| (t.table.clone(), t))
            .collect();
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                tables,
                executed: Vec::new(),
            })),
            failing: None,
        }
    }

    /// Make `execute` fail for statements containing `needle`.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.failing = Some(needle.into());
        self
    }

    /// Committed state.
    pub async fn state(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Committed rows of one table.
    pub async fn table(&self, name: &str) -> Option<TableRows> {
        self.state.lock().await.tables.get(name).cloned()
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn open_history(&self, tables: &[TableDef]) -> Result<Box<dyn HistoryRead>> {
        let state = self.state.lock().await;
        let mut view = MemoryHistory::default();
        for def in tables {
            let Some(stored) = state.tables.get(&def.name) else {
                continue;
            };
            let (columns, positions): (Vec<_>, Vec<_>) = def
                .columns
                .iter()
                .filter_map(|c| stored.position(&c.name).map(|p| (c.clone(), p)))
                .unzip();
            let mut rows = TableRows::new(
                def.name.clone(),
                columns.iter().map(|c| c.name.clone()).collect(),
            );
            rows.rows = stored
                .rows
                .iter()
                .map(|row| positions.iter().map(|p| row[*p].clone()).collect())
                .collect();
            view.tables.push(TableDef {
                name: def.name.clone(),
                columns,
            });
            view.rows.insert(def.name.clone(), rows);
        }
        Ok(Box::new(view))
    }

    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let work = self.state.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.state),
            work,
            failing: self.failing.clone(),
        }))
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// Copy of the committed tables taken when the view was opened.
#[derive(Debug, Default)]
struct MemoryHistory {
    tables: Vec<TableDef>,
    rows: BTreeMap<String, TableRows>,
}

impl MemoryHistory {
    fn stored(&self, table: &str) -> Result<&TableRows> {
        self.rows
            .get(table)
            .ok_or_else(|| MigrateError::dump(0, format!("table {} is not in the store", table)))
    }
}

fn int_cell(row: &[SqlValue], column: usize) -> Option<i64> {
    match row.get(column) {
        Some(SqlValue::I64(n)) => Some(*n),
        _ => None,
    }
}

#[async_trait]
impl HistoryRead for MemoryHistory {
    fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    async fn read_rows(&mut self, table: &str, range: Option<&RowRange>) -> Result<TableRows> {
        let stored = self.stored(table)?;
        let Some(range) = range else {
            return Ok(stored.clone());
        };
        let column = stored.position(&range.column).ok_or_else(|| {
            MigrateError::dump(0, format!("table {} has no column {}", table, range.column))
        })?;
        let mut selected: Vec<(i64, Vec<SqlValue>)> = stored
            .rows
            .iter()
            .filter_map(|row| int_cell(row, column).map(|v| (v, row.clone())))
            .filter(|(v, _)| range.contains(*v))
            .collect();
        selected.sort_by_key(|(v, _)| *v);

        let mut rows = TableRows::new(stored.table.clone(), stored.columns.clone());
        rows.rows = selected.into_iter().map(|(_, row)| row).collect();
        Ok(rows)
    }

    async fn column_stats(&mut self, table: &str, column: &str) -> Result<ColumnStats> {
        let stored = self.stored(table)?;
        let Some(position) = stored.position(column) else {
            return Ok(ColumnStats::default());
        };
        let mut stats = ColumnStats::default();
        for row in &stored.rows {
            match int_cell(row, position) {
                Some(v) => {
                    let (min, max) = stats.bounds.unwrap_or((v, v));
                    stats.bounds = Some((min.min(v), max.max(v)));
                }
                None => stats.nulls += 1,
            }
        }
        Ok(stats)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct MemoryTransaction {
    store: Arc<Mutex<MemoryState>>,
    work: MemoryState,
    failing: Option<String>,
}

#[async_trait]
impl TargetTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        if let Some(needle) = &self.failing {
            if sql.contains(needle.as_str()) {
                return Err(MigrateError::write("<statement>", format!("rejected: {}", sql)));
            }
        }
        self.work.executed.push(sql.to_string());
        Ok(0)
    }

    async fn recreate_schema(&mut self, tables: &[TableDef]) -> Result<()> {
        for def in tables {
            self.work.tables.insert(
                def.name.clone(),
                TableRows::new(def.name.clone(), def.column_names()),
            );
        }
        Ok(())
    }

    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        let stored = self
            .work
            .tables
            .get_mut(table)
            .ok_or_else(|| MigrateError::write(table, "table does not exist"))?;
        let positions = columns
            .iter()
            .map(|c| {
                stored
                    .position(c)
                    .ok_or_else(|| MigrateError::write(table, format!("unknown column '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()?;

        let count = rows.len() as u64;
        let width = stored.columns.len();
        for row in rows {
            if row.len() != positions.len() {
                return Err(MigrateError::write(
                    table,
                    format!("row has {} cells, expected {}", row.len(), positions.len()),
                ));
            }
            let mut full = vec![SqlValue::Null; width];
            for (value, &p) in row.into_iter().zip(&positions) {
                full[p] = value;
            }
            stored.rows.push(full);
        }
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        *self.store.lock().await = self.work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
