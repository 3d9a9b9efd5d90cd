//! PostgreSQL store.

use super::sql::{self, quote_ident};
use super::tls::{self, SslMode};
use super::{ColumnStats, HistoryRead, RowRange, TargetStore, TargetTransaction};
use crate::config::TargetConfig;
use crate::core::{SqlType, SqlValue, TableDef, TableRows};
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::{SinkExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio_postgres::{Config as PgConfig, NoTls, Row, SimpleQueryMessage};
use tracing::{debug, info, warn};

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Store in one schema of a PostgreSQL database.
pub struct PostgresStore {
    pool: Pool,
    schema: String,
}

impl PostgresStore {
    /// Connect and verify the connection.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match tls::connector(SslMode::parse(&config.ssl_mode)?)? {
            Some(connector) => Manager::from_config(pg_config, connector, mgr_config),
            None => {
                warn!("Store TLS is disabled. Credentials will be transmitted in plaintext.");
                Manager::from_config(pg_config, NoTls, mgr_config)
            }
        };
        let pool = Pool::builder(mgr)
            .max_size(config.max_connections)
            .build()
            .map_err(|e| MigrateError::pool(e, "creating PostgreSQL store pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL store connection"))?;
        client.simple_query("SELECT 1").await?;

        info!(
            "Connected to PostgreSQL store: {}:{}/{} (schema {})",
            config.host, config.port, config.database, config.schema
        );

        Ok(Self {
            pool,
            schema: config.schema.clone(),
        })
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, context))
    }
}

#[async_trait]
impl TargetStore for PostgresStore {
    async fn open_history(&self, tables: &[TableDef]) -> Result<Box<dyn HistoryRead>> {
        let client = self.client("reading store history").await?;
        let mut view = PgHistory {
            client: Some(client),
            schema: self.schema.clone(),
            tables: Vec::new(),
        };
        // One snapshot across every read of the view.
        view.client()?
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;

        let mut existing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in view
            .client()?
            .query(
                "SELECT table_name::text, column_name::text FROM information_schema.columns \
                 WHERE table_schema = $1",
                &[&self.schema],
            )
            .await?
        {
            existing
                .entry(row.get(0))
                .or_default()
                .insert(row.get(1));
        }

        for def in tables {
            let Some(present) = existing.get(&def.name) else {
                debug!("table {} not in store, skipped", def.name);
                continue;
            };
            view.tables.push(TableDef {
                name: def.name.clone(),
                columns: def
                    .columns
                    .iter()
                    .filter(|c| present.contains(&c.name))
                    .cloned()
                    .collect(),
            });
        }
        Ok(Box::new(view))
    }

    async fn begin(&self) -> Result<Box<dyn TargetTransaction>> {
        let client = self.client("starting store transaction").await?;
        client.batch_execute("BEGIN").await?;
        client
            .batch_execute(&format!("SET LOCAL search_path TO {}", quote_ident(&self.schema)))
            .await?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
            schema: self.schema.clone(),
        }))
    }

    fn db_type(&self) -> &str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close();
    }
}

fn read_cell(row: &Row, idx: usize, sql_type: SqlType) -> Result<SqlValue> {
    let value = match sql_type {
        SqlType::Boolean => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        SqlType::BigInt => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::I64),
        SqlType::Double => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::F64),
        SqlType::Text => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Read-only repeatable read transaction on one pooled connection.
struct PgHistory {
    client: Option<Object>,
    schema: String,
    tables: Vec<TableDef>,
}

impl PgHistory {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::pool("history view already closed", &self.schema))
    }

    fn table(&self, name: &str) -> Result<&TableDef> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| MigrateError::dump(0, format!("table {} is not in the store", name)))
    }
}

impl Drop for PgHistory {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            debug!("history view dropped open, discarding connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl HistoryRead for PgHistory {
    fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    async fn read_rows(&mut self, table: &str, range: Option<&RowRange>) -> Result<TableRows> {
        let def = self.table(table)?;
        let select_list: Vec<String> = def
            .columns
            .iter()
            .map(|c| format!("CAST({} AS {})", quote_ident(&c.name), c.sql_type.ddl()))
            .collect();
        let mut query = format!(
            "SELECT {} FROM {}",
            select_list.join(", "),
            sql::qualify_table(&self.schema, &def.name)
        );
        let mut params: Vec<i64> = Vec::new();
        if let Some(range) = range {
            let column = quote_ident(&range.column);
            query.push_str(&format!(
                " WHERE {c} > $1 AND {c} <= $2 ORDER BY {c}",
                c = column
            ));
            params.extend([range.after, range.upto]);
        }

        let mut rows = TableRows::new(def.name.clone(), def.column_names());
        let stream = self
            .client()?
            .query_raw(query.as_str(), params)
            .await?;
        futures::pin_mut!(stream);
        while let Some(row) = stream.try_next().await? {
            let cells = def
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| read_cell(&row, i, c.sql_type))
                .collect::<Result<Vec<_>>>()?;
            rows.rows.push(cells);
        }
        debug!("read {} rows from {}", rows.rows.len(), def.name);
        Ok(rows)
    }

    async fn column_stats(&mut self, table: &str, column: &str) -> Result<ColumnStats> {
        let def = self.table(table)?;
        if def.column(column).is_none() {
            return Ok(ColumnStats::default());
        }
        let query = format!(
            "SELECT MIN({c}), MAX({c}), COUNT(*) - COUNT({c}) FROM {t}",
            c = quote_ident(column),
            t = sql::qualify_table(&self.schema, &def.name)
        );
        let row = self.client()?.query_one(query.as_str(), &[]).await?;
        let min: Option<i64> = row.try_get(0)?;
        let max: Option<i64> = row.try_get(1)?;
        let nulls: i64 = row.try_get(2)?;
        Ok(ColumnStats {
            bounds: min.zip(max),
            nulls: nulls.max(0) as u64,
        })
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.client()?.batch_execute("COMMIT").await?;
        self.client.take();
        Ok(())
    }
}

/// Transaction on one pooled connection. The connection is detached from the
/// pool if the transaction is dropped unfinished, so the server aborts it.
struct PgTransaction {
    client: Option<Object>,
    schema: String,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| MigrateError::write(&self.schema, "transaction already finished"))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<()> {
        let client = self.client()?;
        client.batch_execute(statement).await?;
        self.client.take();
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!("store transaction dropped without commit, discarding connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl TargetTransaction for PgTransaction {
    async fn execute(&mut self, statement: &str) -> Result<u64> {
        let messages = self.client()?.simple_query(statement).await?;
        Ok(messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum())
    }

    async fn recreate_schema(&mut self, tables: &[TableDef]) -> Result<()> {
        let client = self.client()?;
        client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&self.schema)
            ))
            .await?;
        for def in tables {
            client.batch_execute(&sql::drop_table(&self.schema, &def.name)).await?;
            client.batch_execute(&sql::create_table(&self.schema, def)).await?;
            debug!("recreated table {}.{}", self.schema, def.name);
        }
        Ok(())
    }

    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<SqlValue>>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let client = self.client()?;
        let row_count = rows.len() as u64;

        let sink = client
            .copy_in(sql::copy_in(&self.schema, table, columns).as_str())
            .await
            .map_err(|e| MigrateError::write(table, format!("COPY init: {}", e)))?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(rows.len() * 64);
        for row in &rows {
            for (i, value) in row.iter().enumerate() {
                if i > 0 {
                    buf.put_u8(b'\t');
                }
                buf.put_slice(sql::copy_text(value).as_bytes());
            }
            buf.put_u8(b'\n');
        }

        sink.send(buf.split().freeze())
            .await
            .map_err(|e| MigrateError::write(table, format!("COPY send: {}", e)))?;
        sink.finish()
            .await
            .map_err(|e| MigrateError::write(table, format!("COPY finish: {}", e)))?;

        Ok(row_count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}
