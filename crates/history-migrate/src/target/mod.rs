//! The store being migrated.
//!
//! A [`TargetStore`] reads the stored history before a replay and accepts the
//! rewritten history afterwards. History is read through a [`HistoryRead`],
//! one consistent view queried a revision range at a time. Everything written
//! during a reload goes through one [`TargetTransaction`], so a failed reload
//! leaves the store as it was.

mod memory;
mod postgres;
pub mod sql;
mod tls;

pub use memory::{MemoryState, MemoryStore};
pub use postgres::PostgresStore;
pub use tls::SslMode;

use crate::core::{SqlValue, TableDef, TableRows};
use crate::error::Result;
use async_trait::async_trait;

/// Rows whose integer `column` lies in `(after, upto]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRange {
    pub column: String,
    pub after: i64,
    pub upto: i64,
}

impl RowRange {
    pub fn new(column: impl Into<String>, after: i64, upto: i64) -> Self {
        Self {
            column: column.into(),
            after,
            upto,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.after < value && value <= self.upto
    }
}

/// Extent of an integer column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnStats {
    /// Smallest and largest value, `None` if every value is null.
    pub bounds: Option<(i64, i64)>,
    pub nulls: u64,
}

/// A versioned object store backed by a database.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Open a consistent read-only view of the given tables.
    ///
    /// Tables that do not exist are left out of the view. Each table keeps
    /// the columns of its definition the store has, in definition order.
    async fn open_history(&self, tables: &[TableDef]) -> Result<Box<dyn HistoryRead>>;

    /// Start the transaction a reload or post-processor runs in.
    async fn begin(&self) -> Result<Box<dyn TargetTransaction>>;

    fn db_type(&self) -> &str;

    /// Close all connections.
    async fn close(&self);
}

/// Read-only view of the stored history. Every read sees the same state.
#[async_trait]
pub trait HistoryRead: Send {
    /// Tables present in the store, projected to their stored columns.
    fn tables(&self) -> &[TableDef];

    /// Rows of a present table, all of them or those in `range` ordered by
    /// the range column.
    async fn read_rows(&mut self, table: &str, range: Option<&RowRange>) -> Result<TableRows>;

    /// Extent of an integer column of a present table.
    async fn column_stats(&mut self, table: &str, column: &str) -> Result<ColumnStats>;

    /// End the view.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Writes inside one store transaction. Dropping it without `commit` discards
/// everything written.
#[async_trait]
pub trait TargetTransaction: Send {
    /// Run a statement, returning the number of rows it affected.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Drop and recreate the given tables, empty.
    async fn recreate_schema(&mut self, tables: &[TableDef]) -> Result<()>;

    /// Append rows to a table.
    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
