//! Revision source: history reconstruction and dump files.

pub mod dump;
mod history;

pub use dump::{DumpHeader, DumpReader, DumpRecord, DumpWriter, RawRow, DUMP_FORMAT_VERSION};
pub use history::{raw_rows, HistoryBuilder};

use crate::core::TableRows;

/// Rows of store tables, as captured to seed a [`MemoryStore`].
///
/// [`MemoryStore`]: crate::target::MemoryStore
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub tables: Vec<TableRows>,
}

impl StoreSnapshot {
    /// Rows of one table, if it exists in the store.
    pub fn table(&self, name: &str) -> Option<&TableRows> {
        self.tables.iter().find(|t| t.table == name)
    }
}
