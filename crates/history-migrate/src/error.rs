//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, unknown stage, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A reference or identifier could not be resolved
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// An event has a shape a stage cannot transform
    #[error("Structural error: {0}")]
    Structural(String),

    /// An index key is owned by more than one object
    #[error("Ambiguous index key {key} in index {index}")]
    Ambiguous { index: String, key: String },

    /// Dump file is malformed or out of order
    #[error("Dump error at record {record}: {message}")]
    Dump { record: u64, message: String },

    /// Errors were recorded during a phase
    #[error("{count} error(s) recorded during {phase}, first: {first}")]
    ErrorsRecorded {
        phase: String,
        count: usize,
        first: String,
    },

    /// Schema or post-load processor failed
    #[error("Processor {name} failed: {message}")]
    Processor { name: String, message: String },

    /// Writing reloaded rows or statements to the store failed
    #[error("Write failed for {table}: {message}")]
    Write { table: String, message: String },

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// State file error
    #[error("State file error: {0}")]
    State(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a Dump error for the given record number
    pub fn dump(record: u64, message: impl Into<String>) -> Self {
        MigrateError::Dump {
            record,
            message: message.into(),
        }
    }

    /// Create a Processor error
    pub fn processor(name: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Processor {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 1,
            MigrateError::ErrorsRecorded { .. }
            | MigrateError::Resolution(_)
            | MigrateError::Structural(_)
            | MigrateError::Ambiguous { .. } => 2,
            MigrateError::Target(_) | MigrateError::Pool { .. } | MigrateError::Write { .. } => 3,
            MigrateError::Dump { .. } | MigrateError::Json(_) => 4,
            MigrateError::Processor { .. } => 5,
            MigrateError::State(_) => 6,
            MigrateError::Io(_) => 7,
            MigrateError::Cancelled => 130,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
