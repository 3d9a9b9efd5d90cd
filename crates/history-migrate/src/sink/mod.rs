//! Load script: the transformed history as ordered row inserts.
//!
//! A script is a gzip JSON Lines file of [`ScriptEntry`] values. Entries are
//! applied in file order inside the reload transaction, after the target
//! schema has been recreated.

mod script;

pub use script::{ScriptStats, ScriptSummary, ScriptWriter};

use crate::core::SqlValue;
use crate::error::{MigrateError, Result};
use crate::jsonl::{self, GzFileReader};
use crate::target::sql;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

/// One step of a load script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ScriptEntry {
    /// Rows for one table, in the table's column order.
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// A statement run as is.
    Statement { sql: String },
}

impl ScriptEntry {
    /// Render as SQL against `schema`.
    pub fn to_sql(&self, schema: &str) -> String {
        match self {
            ScriptEntry::Insert {
                table,
                columns,
                rows,
            } => sql::insert(schema, table, columns, rows),
            ScriptEntry::Statement { sql } => sql.clone(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            ScriptEntry::Insert { rows, .. } => rows.len(),
            ScriptEntry::Statement { .. } => 0,
        }
    }
}

/// Forward-only script reader.
pub struct ScriptReader<R: BufRead> {
    input: R,
    buf: String,
    entry: u64,
}

impl ScriptReader<GzFileReader> {
    /// Open a gzip script file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(jsonl::open_gz(path)?))
    }
}

impl<R: BufRead> ScriptReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            buf: String::new(),
            entry: 0,
        }
    }

    /// Next entry, or `None` at end of script.
    pub fn next_entry(&mut self) -> Result<Option<ScriptEntry>> {
        let entry = jsonl::read_line(&mut self.input, &mut self.buf).map_err(|e| match e {
            MigrateError::Json(json) => MigrateError::dump(
                self.entry + 1,
                format!("malformed script entry: {}", json),
            ),
            other => other,
        })?;
        if entry.is_some() {
            self.entry += 1;
        }
        Ok(entry)
    }
}

impl<R: BufRead> Iterator for ScriptReader<R> {
    type Item = Result<ScriptEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_json_shape() {
        let entry = ScriptEntry::Insert {
            table: "person".into(),
            columns: vec!["_id".into(), "name".into()],
            rows: vec![vec![SqlValue::I64(1), SqlValue::Null]],
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"entry":"insert","table":"person","columns":["_id","name"],"rows":[[1,null]]}"#
        );
        assert_eq!(entry.row_count(), 1);
    }

    #[test]
    fn test_reader_reports_malformed_entry() {
        let data = b"{\"entry\":\"statement\",\"sql\":\"ANALYZE\"}\n{\"entry\":\"nope\"}\n";
        let mut reader = ScriptReader::new(&data[..]);
        assert_eq!(
            reader.next_entry().unwrap(),
            Some(ScriptEntry::Statement {
                sql: "ANALYZE".into()
            })
        );
        let err = reader.next_entry().unwrap_err();
        assert!(matches!(err, MigrateError::Dump { record: 2, .. }));
    }

    #[test]
    fn test_statement_to_sql() {
        let entry = ScriptEntry::Statement {
            sql: "ANALYZE \"public\".\"person\"".into(),
        };
        assert_eq!(entry.to_sql("ignored"), "ANALYZE \"public\".\"person\"");
    }
}
