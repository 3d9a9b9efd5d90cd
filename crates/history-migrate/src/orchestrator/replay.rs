//! The three replay steps: dump the store, transform the dump into a load
//! script, apply the script.

use crate::config::Config;
use crate::core::schema::{store_tables, BRANCH_TABLE, COL_ID, COL_REV_MIN, REVISION_TABLE};
use crate::core::{ObjectId, Revision, SchemaTypes, TableRows, TypeDef, TypeDirectory};
use crate::error::{MigrateError, Result};
use crate::pipeline::{Pipeline, PipelineStats, StageRegistry};
use crate::report::ErrorLog;
use crate::sink::{ScriptEntry, ScriptReader, ScriptStats, ScriptWriter};
use crate::source::{raw_rows, DumpHeader, DumpReader, DumpRecord, DumpWriter, HistoryBuilder};
use crate::target::{HistoryRead, RowRange, TargetStore, TargetTransaction};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of dumping the store.
#[derive(Debug, Clone, Serialize)]
pub struct DumpSummary {
    pub records: u64,
    pub rows_read: usize,
    pub max_object_id: ObjectId,
}

/// Outcome of the transform step.
#[derive(Debug, Clone, Serialize)]
pub struct TransformSummary {
    /// First id handed out to remapped objects.
    pub id_start: ObjectId,
    pub pipeline: PipelineStats,
    pub script: ScriptStats,
    pub errors: ErrorLog,
}

/// Read the store's history and write it as a dump file.
///
/// The store is read `window` revisions at a time and each window's change
/// sets are handed to a blocking writer as soon as they are built.
pub async fn dump_store(
    target: &dyn TargetStore,
    types: &SchemaTypes,
    path: &Path,
    window: Revision,
) -> Result<DumpSummary> {
    let mut view = target.open_history(&store_tables(types)).await?;
    let dumped = dump_view(view.as_mut(), types, path, window.max(1)).await;
    let closed = view.close().await;
    let summary = dumped?;
    closed?;
    Ok(summary)
}

async fn dump_view(
    view: &mut dyn HistoryRead,
    types: &SchemaTypes,
    path: &Path,
    window: Revision,
) -> Result<DumpSummary> {
    let present: HashSet<String> = view.tables().iter().map(|t| t.name.clone()).collect();

    // The header carries the largest id, so it is looked up before any row.
    let mut max_object_id = 0;
    for def in types.types() {
        if present.contains(def.table_name()) {
            let stats = view.column_stats(def.table_name(), COL_ID).await?;
            if let Some((_, max)) = stats.bounds {
                max_object_id = max_object_id.max(max);
            }
        }
    }

    let (sender, mut receiver) = mpsc::channel::<DumpRecord>(16);
    let header = DumpHeader::new(max_object_id);
    let file = path.to_path_buf();
    let writer = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut writer = DumpWriter::create(&file, &header)?;
        while let Some(record) = receiver.blocking_recv() {
            writer.write(&record)?;
        }
        writer.close()
    });

    let produced = read_records(view, types, &present, window, &sender).await;
    drop(sender);
    let written = writer.await.map_err(join_error)?;
    // A failed writer stops the reader too; its error is the cause.
    let records = written?;
    let rows_read = produced?;

    info!("Dump written: {} records to {:?}", records, path);
    Ok(DumpSummary {
        records,
        rows_read,
        max_object_id,
    })
}

/// Send every dump record: unversioned objects, raw rows, then change sets.
async fn read_records(
    view: &mut dyn HistoryRead,
    types: &SchemaTypes,
    present: &HashSet<String>,
    window: Revision,
    sender: &mpsc::Sender<DumpRecord>,
) -> Result<usize> {
    let mut builder = HistoryBuilder::new(types);
    let mut rows_read = 0;

    for def in types.types().into_iter().filter(|d| !d.versioned) {
        if !present.contains(def.table_name()) {
            debug!("Table {} of type {} not present, skipping", def.table_name(), def.name);
            continue;
        }
        let rows = view.read_rows(def.table_name(), None).await?;
        rows_read += rows.rows.len();
        for creation in builder.unversioned(def, &rows)? {
            send(sender, DumpRecord::Unversioned(creation)).await?;
        }
    }
    for table in types.raw_tables() {
        if !present.contains(&table.name) {
            continue;
        }
        let rows = view.read_rows(&table.name, None).await?;
        rows_read += rows.rows.len();
        for row in raw_rows(rows) {
            send(sender, DumpRecord::Row(row)).await?;
        }
    }
    if present.contains(BRANCH_TABLE) {
        let rows = view.read_rows(BRANCH_TABLE, None).await?;
        rows_read += rows.rows.len();
        builder.branches(&rows)?;
    }

    // Every source of events is read by revision.
    let mut sources: Vec<(&str, &str, Option<&TypeDef>)> = Vec::new();
    if present.contains(REVISION_TABLE) {
        sources.push((REVISION_TABLE, "rev", None));
    } else {
        warn!("Revision table not present, history has no commit metadata");
    }
    for def in types.types().into_iter().filter(|d| d.versioned) {
        if present.contains(def.table_name()) {
            sources.push((def.table_name(), COL_REV_MIN, Some(def)));
        } else {
            debug!("Table {} of type {} not present, skipping", def.table_name(), def.name);
        }
    }

    let mut bounds: Option<(Revision, Revision)> = None;
    for (table, column, _) in &sources {
        let stats = view.column_stats(table, column).await?;
        if stats.nulls > 0 {
            return Err(MigrateError::dump(0, format!("{}.{} is required", table, column)));
        }
        if let Some((min, max)) = stats.bounds {
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                None => (min, max),
            });
        }
    }

    if let Some((first, last)) = bounds {
        let mut after = first - 1;
        while after < last {
            let upto = after.saturating_add(window).min(last);
            let mut commits = TableRows::new(REVISION_TABLE, Vec::new());
            let mut versions = Vec::new();
            for (table, column, def) in &sources {
                let range = RowRange::new(*column, after, upto);
                let rows = view.read_rows(table, Some(&range)).await?;
                rows_read += rows.rows.len();
                match def {
                    Some(def) => versions.push((*def, rows)),
                    None => commits = rows,
                }
            }
            debug!("Read revisions {} to {}", after + 1, upto);
            for cs in builder.window(upto, &commits, &versions)? {
                send(sender, DumpRecord::ChangeSet(cs)).await?;
            }
            after = upto;
        }
    }
    for cs in builder.finish() {
        send(sender, DumpRecord::ChangeSet(cs)).await?;
    }
    Ok(rows_read)
}

async fn send(sender: &mpsc::Sender<DumpRecord>, record: DumpRecord) -> Result<()> {
    sender
        .send(record)
        .await
        .map_err(|_| MigrateError::Io(std::io::Error::other("dump writer stopped")))
}

/// Run a dump through the pipeline and write the load script.
///
/// Recorded errors do not stop the transform; they are returned in the
/// summary so every problem of a run is reported at once. Dump format and
/// I/O errors abort immediately.
pub fn transform_dump(
    config: &Config,
    types: &dyn TypeDirectory,
    registry: &StageRegistry,
    dump: &Path,
    script: &Path,
) -> Result<TransformSummary> {
    let started = Instant::now();
    let mut reader = DumpReader::open(dump)?;
    let id_start = config
        .migration
        .id_start
        .unwrap_or(reader.header().max_object_id + 1);

    let mut pipeline = Pipeline::build(config, types, registry, id_start)?;
    let mut writer = ScriptWriter::create(
        script,
        types,
        config.migration.buffer_size,
        config.migration.insert_chunk_size,
    )?;

    while let Some(record) = reader.next_record()? {
        match record {
            DumpRecord::ChangeSet(cs) => {
                for out in pipeline.process(cs)? {
                    writer.write_change_set(out)?;
                }
            }
            DumpRecord::Unversioned(creation) => {
                for out in pipeline.process_unversioned(creation)? {
                    writer.write_unversioned(out)?;
                }
            }
            DumpRecord::Row(row) => writer.write_row(row)?,
        }
    }
    for out in pipeline.finish()? {
        writer.write_change_set(out)?;
    }

    let mut stats = pipeline.stats().clone();
    stats.finalize(started.elapsed());
    info!("{}", stats.summary());

    let script_summary = writer.close()?;
    let mut errors = pipeline.into_errors();
    errors.extend(script_summary.errors);

    Ok(TransformSummary {
        id_start,
        pipeline: stats,
        script: script_summary.stats,
        errors,
    })
}

/// Recreate the store tables and apply a load script, inside `tx`.
///
/// Returns the number of rows written. The script is read on a blocking
/// thread and streamed in file order.
pub async fn apply_script(
    tx: &mut dyn TargetTransaction,
    types: &SchemaTypes,
    script: PathBuf,
) -> Result<u64> {
    tx.recreate_schema(&store_tables(types)).await?;

    let (sender, mut receiver) = mpsc::channel::<ScriptEntry>(16);
    let reader = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut entries = 0;
        for entry in ScriptReader::open(&script)? {
            if sender.blocking_send(entry?).is_err() {
                break;
            }
            entries += 1;
        }
        Ok(entries)
    });

    let mut rows = 0;
    while let Some(entry) = receiver.recv().await {
        match entry {
            ScriptEntry::Insert {
                table,
                columns,
                rows: values,
            } => rows += tx.write_batch(&table, &columns, values).await?,
            ScriptEntry::Statement { sql } => {
                tx.execute(&sql).await?;
            }
        }
    }
    let entries = reader.await.map_err(join_error)??;
    info!("Applied {} script entries, {} rows", entries, rows);
    Ok(rows)
}

pub(super) fn join_error(e: tokio::task::JoinError) -> MigrateError {
    MigrateError::Io(std::io::Error::other(e))
}
