//! Configuration type definitions.

use crate::core::{Revision, TableDef, TypeDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store being migrated in place (PostgreSQL).
    pub target: TargetConfig,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Types and raw tables of the store.
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Migration units, applied in order.
    #[serde(default)]
    pub units: Vec<UnitConfig>,
}

/// Target database (PostgreSQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database type (always "postgres" for now).
    #[serde(default = "default_postgres")]
    pub r#type: String,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// TLS mode: disable, require, verify-ca or verify-full (default: disable).
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,

    /// Maximum pool connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Directory for the dump and load script (default: system temp dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,

    /// Rows buffered by the script writer before a flush (default: 1000000).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Maximum rows per insert batch (default: 10000).
    #[serde(default = "default_insert_chunk_size")]
    pub insert_chunk_size: usize,

    /// Revisions read from the store per query when dumping (default: 1000).
    #[serde(default = "default_read_window")]
    pub read_window: i64,

    /// Keep dump and script files after the run (default: false).
    #[serde(default)]
    pub keep_temp_files: bool,

    /// Change sets with more events than this are logged (default: 1000).
    #[serde(default = "default_log_size_threshold")]
    pub log_size_threshold: usize,

    /// First id handed out by id remapping. Defaults to one past the largest
    /// id found in the dump.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_start: Option<i64>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            work_dir: None,
            buffer_size: default_buffer_size(),
            insert_chunk_size: default_insert_chunk_size(),
            read_window: default_read_window(),
            keep_temp_files: false,
            log_size_threshold: default_log_size_threshold(),
            id_start: None,
        }
    }
}

impl MigrationConfig {
    /// Directory for temporary files.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Types and raw tables of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub types: Vec<TypeDef>,

    /// Tables outside the object model, copied row by row.
    #[serde(default)]
    pub tables: Vec<TableDef>,
}

/// One migration unit: a stage list, an optional merge range, processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub name: String,

    /// Pipeline stages, applied in order.
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    /// Revisions to coalesce into one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeRange>,

    /// Schema changes applied before the replay.
    #[serde(default)]
    pub schema_processors: Vec<ProcessorConfig>,

    /// Processors run after a successful reload.
    #[serde(default)]
    pub post_processors: Vec<ProcessorConfig>,
}

/// Declarative stage description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registered stage kind, e.g. "attribute-filter".
    pub kind: String,

    /// Restrict the stage to these object types (empty: all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    /// Restrict the stage to events matching all of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predicates: Vec<PredicateConfig>,

    /// Kind specific parameters.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

/// Event predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PredicateConfig {
    /// Text form of the attribute matches a regex.
    AttributeMatches { attribute: String, pattern: String },
    /// Text form of the attribute equals a value.
    AttributeEquals { attribute: String, value: String },
    /// The event sets the attribute.
    HasAttribute { attribute: String },
    /// The attribute references an object of one of these types.
    ReferenceTargetType {
        attribute: String,
        types: Vec<String>,
    },
}

/// Closed revision range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRange {
    pub start: Revision,
    pub stop: Revision,
}

impl MergeRange {
    pub fn contains(&self, revision: Revision) -> bool {
        self.start <= revision && revision <= self.stop
    }

    pub fn overlaps(&self, other: &MergeRange) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }
}

/// Declarative processor description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Registered processor kind, e.g. "sql".
    pub kind: String,

    /// Whether this schema change forces a full replay.
    #[serde(default)]
    pub requires_replay: bool,

    /// Kind specific parameters.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

// Default value functions
fn default_postgres() -> String {
    "postgres".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_ssl_mode() -> String {
    "disable".to_string()
}

fn default_max_connections() -> usize {
    4
}

fn default_buffer_size() -> usize {
    1_000_000
}

fn default_insert_chunk_size() -> usize {
    10_000
}

fn default_read_window() -> i64 {
    1000
}

fn default_log_size_threshold() -> usize {
    1000
}
