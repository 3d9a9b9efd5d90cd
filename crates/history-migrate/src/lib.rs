//! # history-migrate
//!
//! Replays the complete revision history of a versioned object store through
//! a chain of rewriting stages and rebuilds the store from the result.
//!
//! - **History reconstruction** from the versioned tables of the store
//! - **Stateful stages** that filter, rewrite, inline and remap objects
//! - **Attribute indexes** kept current revision by revision
//! - **Revision merging** of a configured range into one revision
//! - **Transactional reload**: the store is only rebuilt once the whole load
//!   script was produced without errors
//! - **Run journal** via signed JSON state files
//!
//! ## Example
//!
//! ```rust,no_run
//! use history_migrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> history_migrate::Result<()> {
//!     let config = Config::load("migration.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let result = orchestrator.run(false).await?;
//!     println!("Loaded {} rows", result.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod jsonl;
pub mod mapping;
pub mod orchestrator;
pub mod pipeline;
pub mod processors;
pub mod report;
pub mod sink;
pub mod source;
pub mod state;
pub mod target;

// Re-exports for convenient access
pub use config::{Config, MigrationConfig, TargetConfig, UnitConfig};
pub use error::{MigrateError, Result};
pub use orchestrator::{MigrationPlan, MigrationResult, Orchestrator};
pub use pipeline::{Pipeline, StageRegistry};
pub use report::{ErrorKind, ErrorLog};
pub use state::MigrationState;
pub use target::{MemoryStore, PostgresStore, TargetStore};
