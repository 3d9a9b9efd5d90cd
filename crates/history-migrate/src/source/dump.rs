//! Revision dump format.
//!
//! A dump is a gzip JSON Lines file. The first line is a [`DumpHeader`];
//! every following line is a [`DumpRecord`]. Change sets appear in strictly
//! increasing revision order. Unversioned objects and raw rows may appear
//! anywhere.

use crate::core::{ChangeSet, ObjectCreation, ObjectId, Revision, SqlValue};
use crate::error::{MigrateError, Result};
use crate::jsonl::{self, GzFileReader, GzFileWriter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;

/// Current dump format version.
pub const DUMP_FORMAT_VERSION: u32 = 1;

/// First line of a dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpHeader {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Largest object id anywhere in the dump.
    pub max_object_id: ObjectId,
}

impl DumpHeader {
    pub fn new(max_object_id: ObjectId) -> Self {
        Self {
            format_version: DUMP_FORMAT_VERSION,
            created_at: Utc::now(),
            max_object_id,
        }
    }
}

/// A row of a table outside the object model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

/// One dump line after the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum DumpRecord {
    ChangeSet(ChangeSet),
    Unversioned(ObjectCreation),
    Row(RawRow),
}

/// Forward-only dump reader.
pub struct DumpReader<R: BufRead> {
    input: R,
    buf: String,
    header: DumpHeader,
    record: u64,
    last_revision: Option<Revision>,
}

impl DumpReader<GzFileReader> {
    /// Open a gzip dump file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(jsonl::open_gz(path)?)
    }
}

impl<R: BufRead> DumpReader<R> {
    /// Wrap a reader positioned at the header line.
    pub fn new(mut input: R) -> Result<Self> {
        let mut buf = String::new();
        let header: DumpHeader = jsonl::read_line(&mut input, &mut buf)?
            .ok_or_else(|| MigrateError::dump(0, "missing dump header"))?;
        if header.format_version != DUMP_FORMAT_VERSION {
            return Err(MigrateError::dump(
                0,
                format!("unsupported dump format version {}", header.format_version),
            ));
        }
        Ok(Self {
            input,
            buf,
            header,
            record: 0,
            last_revision: None,
        })
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    /// Next record, or `None` at end of dump.
    pub fn next_record(&mut self) -> Result<Option<DumpRecord>> {
        let record: Option<DumpRecord> = jsonl::read_line(&mut self.input, &mut self.buf)
            .map_err(|e| match e {
                MigrateError::Json(json) => MigrateError::dump(self.record + 1, json.to_string()),
                other => other,
            })?;
        let Some(record) = record else {
            return Ok(None);
        };
        self.record += 1;

        if let DumpRecord::ChangeSet(cs) = &record {
            if let Some(last) = self.last_revision {
                if cs.revision <= last {
                    return Err(MigrateError::dump(
                        self.record,
                        format!("revision {} follows revision {}", cs.revision, last),
                    ));
                }
            }
            self.last_revision = Some(cs.revision);
        }
        Ok(Some(record))
    }

    /// Number of records read so far.
    pub fn records_read(&self) -> u64 {
        self.record
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Dump writer enforcing revision order.
pub struct DumpWriter<W: Write> {
    out: W,
    records: u64,
    last_revision: Option<Revision>,
}

impl DumpWriter<GzFileWriter> {
    /// Create a gzip dump file.
    pub fn create<P: AsRef<Path>>(path: P, header: &DumpHeader) -> Result<Self> {
        Self::new(jsonl::create_gz(path)?, header)
    }

    /// Finish the gzip stream and flush the file.
    pub fn close(self) -> Result<u64> {
        let records = self.records;
        jsonl::finish_gz(self.out)?;
        Ok(records)
    }
}

impl<W: Write> DumpWriter<W> {
    pub fn new(mut out: W, header: &DumpHeader) -> Result<Self> {
        jsonl::write_line(&mut out, header)?;
        Ok(Self {
            out,
            records: 0,
            last_revision: None,
        })
    }

    pub fn write(&mut self, record: &DumpRecord) -> Result<()> {
        if let DumpRecord::ChangeSet(cs) = record {
            if let Some(last) = self.last_revision {
                if cs.revision <= last {
                    return Err(MigrateError::dump(
                        self.records + 1,
                        format!("cannot write revision {} after {}", cs.revision, last),
                    ));
                }
            }
            self.last_revision = Some(cs.revision);
        }
        jsonl::write_line(&mut self.out, record)?;
        self.records += 1;
        Ok(())
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
