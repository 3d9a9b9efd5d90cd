//! Migration orchestrator - main workflow coordinator.
//!
//! Phases, in order:
//!
//! 1. build: type directory, pipeline and processors are assembled; every
//!    configuration error surfaces here
//! 2. schema migrations, in one transaction
//! 3. dump of the store (only when a replay is required)
//! 4. transform of the dump into a load script
//! 5. reload: the store tables are dropped, recreated and filled from the
//!    script, in one transaction
//! 6. post-load processors, in one transaction
//!
//! Recorded errors are checked after every phase. Nothing destructive happens
//! before the load script has been written without errors.

mod replay;

pub use replay::{apply_script, dump_store, transform_dump, DumpSummary, TransformSummary};

use crate::config::Config;
use crate::core::SchemaTypes;
use crate::error::{MigrateError, Result};
use crate::pipeline::{Pipeline, StageRegistry};
use crate::processors::{PostProcessor, ProcessorRegistry, SchemaProcessor};
use crate::report::{ErrorLog, RecordedError};
use crate::state::MigrationState;
use crate::target::{PostgresStore, TargetStore, TargetTransaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type Processors = (Vec<Box<dyn SchemaProcessor>>, Vec<Box<dyn PostProcessor>>);

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    types: SchemaTypes,
    target: Arc<dyn TargetStore>,
    stages: Arc<StageRegistry>,
    processors: ProcessorRegistry,
    state_file: Option<PathBuf>,
    cancel: CancellationToken,
}

/// What a run will do, as decided in the build phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Stage names in chain order, merge stages last.
    pub stages: Vec<String>,
    pub schema_processors: Vec<String>,
    pub post_processors: Vec<String>,
    pub replay_required: bool,
}

impl MigrationPlan {
    /// Assemble the pipeline and processors of a configuration. Fails with
    /// the first configuration error.
    pub fn build(
        config: &Config,
        stages: &StageRegistry,
        processors: &ProcessorRegistry,
    ) -> Result<Self> {
        let types = config.type_directory()?;
        let pipeline = Pipeline::build(config, &types, stages, 1)?;
        let (schema, post) = build_processors(config, processors)?;

        let replay_required =
            !pipeline.is_identity() || schema.iter().any(|p| p.requires_replay());
        Ok(Self {
            stages: pipeline.stage_names().into_iter().map(String::from).collect(),
            schema_processors: schema.iter().map(|p| p.name().to_string()).collect(),
            post_processors: post.iter().map(|p| p.name().to_string()).collect(),
            replay_required,
        })
    }
}

fn build_processors(config: &Config, registry: &ProcessorRegistry) -> Result<Processors> {
    let mut schema = Vec::new();
    let mut post = Vec::new();
    for unit in &config.units {
        for processor in &unit.schema_processors {
            let built = registry.build_schema(processor);
            schema.push(built.map_err(|e| in_unit(&unit.name, e))?);
        }
        for processor in &unit.post_processors {
            let built = registry.build_post(processor);
            post.push(built.map_err(|e| in_unit(&unit.name, e))?);
        }
    }
    Ok((schema, post))
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: "completed", or "planned" for a dry run.
    pub status: String,

    pub plan: MigrationPlan,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub started_at: DateTime<Utc>,

    pub completed_at: DateTime<Utc>,

    /// Change sets read from the dump.
    pub revisions_read: u64,

    /// Change sets written to the load script.
    pub revisions_written: u64,

    /// Rows written to the store by the reload.
    pub rows_loaded: u64,

    /// Errors recorded during the run. Empty for a completed run.
    pub errors: Vec<RecordedError>,
}

impl Orchestrator {
    /// Create an orchestrator connected to the configured PostgreSQL store.
    pub async fn new(config: Config) -> Result<Self> {
        let target = PostgresStore::connect(&config.target).await?;
        Self::with_target(config, Arc::new(target))
    }

    /// Create an orchestrator working on the given store.
    pub fn with_target(config: Config, target: Arc<dyn TargetStore>) -> Result<Self> {
        let types = config.type_directory()?;
        Ok(Self {
            config,
            types,
            target,
            stages: Arc::new(StageRegistry::with_builtins()),
            processors: ProcessorRegistry::with_builtins(),
            state_file: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Write a run journal to this path.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.state_file = Some(path);
        self
    }

    /// Stop between phases once this token is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_stage_registry(mut self, registry: StageRegistry) -> Self {
        self.stages = Arc::new(registry);
        self
    }

    pub fn with_processor_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.processors = registry;
        self
    }

    /// Assemble pipeline and processors without touching the store.
    pub fn plan(&self) -> Result<MigrationPlan> {
        MigrationPlan::build(&self.config, &self.stages, &self.processors)
    }

    /// Run the migration. A dry run builds the plan and, when a replay is
    /// required, dumps and transforms the history without writing to the
    /// store.
    pub async fn run(self, dry_run: bool) -> Result<MigrationResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut state = MigrationState::new(run_id.clone(), self.config.hash());
        self.save_state(&mut state)?;

        info!("Starting migration run: {}", run_id);
        let mut result = MigrationResult {
            run_id,
            status: "running".to_string(),
            plan: MigrationPlan::default(),
            duration_seconds: 0.0,
            started_at,
            completed_at: started_at,
            revisions_read: 0,
            revisions_written: 0,
            rows_loaded: 0,
            errors: Vec::new(),
        };

        let outcome = self.execute(&mut state, &mut result, dry_run).await;
        match &outcome {
            Ok(()) => state.mark_completed(),
            Err(MigrateError::Cancelled) => state.mark_cancelled(),
            Err(e) => state.mark_failed(&e.to_string()),
        }
        let saved = self.save_state(&mut state);
        self.target.close().await;
        outcome?;
        saved?;

        result.status = if dry_run { "planned" } else { "completed" }.to_string();
        result.completed_at = Utc::now();
        result.duration_seconds =
            (result.completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        info!(
            "Migration {}: {} revisions replayed into {}, {} rows loaded in {:.1}s",
            result.status,
            result.revisions_read,
            result.revisions_written,
            result.rows_loaded,
            result.duration_seconds
        );
        Ok(result)
    }

    async fn execute(
        &self,
        state: &mut MigrationState,
        result: &mut MigrationResult,
        dry_run: bool,
    ) -> Result<()> {
        // Phase 1: Build
        info!("Phase 1: Building pipeline");
        state.begin_phase("build");
        let plan = self.plan()?;
        let (schema_processors, post_processors) =
            build_processors(&self.config, &self.processors)?;
        info!(
            "{} stages, {} schema processors, {} post processors, replay required: {}",
            plan.stages.len(),
            plan.schema_processors.len(),
            plan.post_processors.len(),
            plan.replay_required
        );
        result.plan = plan.clone();
        state.complete_phase("build", Some(format!("{} stages", plan.stages.len())));
        self.save_state(state)?;
        self.check_cancelled()?;

        // Phase 2: Schema migrations
        if dry_run {
            state.skip_phase("schema", "dry run");
        } else if schema_processors.is_empty() {
            state.skip_phase("schema", "no schema processors");
        } else {
            info!("Phase 2: Applying schema migrations");
            state.begin_phase("schema");
            self.run_schema_processors(&schema_processors).await?;
            state.complete_phase("schema", None);
        }
        self.save_state(state)?;
        self.check_cancelled()?;

        if plan.replay_required {
            self.replay(state, result, dry_run).await?;
        } else {
            info!("No replay required");
            state.skip_phase("replay", "no stages, merge ranges or replaying schema changes");
            self.save_state(state)?;
        }
        self.check_cancelled()?;

        // Phase 6: Post-load processors
        if dry_run {
            state.skip_phase("post", "dry run");
        } else if post_processors.is_empty() {
            state.skip_phase("post", "no post processors");
        } else {
            info!("Phase 6: Running post-load processors");
            state.begin_phase("post");
            self.run_post_processors(&post_processors).await?;
            state.complete_phase("post", None);
        }
        self.save_state(state)
    }

    async fn replay(
        &self,
        state: &mut MigrationState,
        result: &mut MigrationResult,
        dry_run: bool,
    ) -> Result<()> {
        let work_dir = self.config.migration.work_dir();
        std::fs::create_dir_all(&work_dir)?;
        let dump_path = work_dir.join(format!("{}-dump.jsonl.gz", state.run_id));
        let script_path = work_dir.join(format!("{}-script.jsonl.gz", state.run_id));

        // Phase 3: Dump
        info!("Phase 3: Dumping store history");
        state.begin_phase("dump");
        let dump = dump_store(
            self.target.as_ref(),
            &self.types,
            &dump_path,
            self.config.migration.read_window,
        )
        .await?;
        state.complete_phase("dump", Some(format!("{} records", dump.records)));
        self.save_state(state)?;
        self.check_cancelled()?;

        // Phase 4: Transform
        info!("Phase 4: Transforming history");
        state.begin_phase("transform");
        let summary = {
            let config = self.config.clone();
            let types = self.types.clone();
            let stages = Arc::clone(&self.stages);
            let (dump, script) = (dump_path.clone(), script_path.clone());
            tokio::task::spawn_blocking(move || {
                transform_dump(&config, &types, &stages, &dump, &script)
            })
            .await
            .map_err(replay::join_error)??
        };
        result.revisions_read = summary.pipeline.revisions_read;
        result.revisions_written = summary.pipeline.revisions_written;
        result.errors = summary.errors.errors().to_vec();
        summary.errors.check("transform")?;
        state.complete_phase(
            "transform",
            Some(format!(
                "{} revisions, {} rows",
                summary.script.revisions, summary.script.rows
            )),
        );
        self.save_state(state)?;

        if dry_run {
            info!("Dry run: load script left at {:?}", script_path);
            state.skip_phase("reload", "dry run");
            return Ok(());
        }
        self.check_cancelled()?;

        // Phase 5: Reload. Not cancellable once started.
        info!("Phase 5: Reloading store");
        state.begin_phase("reload");
        self.save_state(state)?;
        let mut tx = self.target.begin().await?;
        match apply_script(tx.as_mut(), &self.types, script_path.clone()).await {
            Ok(rows) => {
                tx.commit().await?;
                result.rows_loaded = rows;
                state.complete_phase("reload", Some(format!("{} rows", rows)));
            }
            Err(e) => {
                rollback(tx).await;
                return Err(e);
            }
        }
        self.save_state(state)?;

        if !self.config.migration.keep_temp_files {
            remove_temp_file(&dump_path);
            remove_temp_file(&script_path);
        }
        Ok(())
    }

    async fn run_schema_processors(&self, processors: &[Box<dyn SchemaProcessor>]) -> Result<()> {
        let mut tx = self.target.begin().await?;
        let mut errors = ErrorLog::new();
        let mut outcome = Ok(());
        for processor in processors {
            info!("Schema processor: {}", processor.name());
            outcome = processor.apply(tx.as_mut(), &mut errors).await;
            if outcome.is_err() {
                break;
            }
        }
        finish_processors(tx, outcome, &errors, "schema migrations").await
    }

    async fn run_post_processors(&self, processors: &[Box<dyn PostProcessor>]) -> Result<()> {
        let mut tx = self.target.begin().await?;
        let mut errors = ErrorLog::new();
        let mut outcome = Ok(());
        for processor in processors {
            info!("Post processor: {}", processor.name());
            outcome = processor.run(tx.as_mut(), &mut errors).await;
            if outcome.is_err() {
                break;
            }
        }
        finish_processors(tx, outcome, &errors, "post-load processing").await
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!("Migration cancelled");
            return Err(MigrateError::Cancelled);
        }
        Ok(())
    }

    /// Save state to file.
    fn save_state(&self, state: &mut MigrationState) -> Result<()> {
        if let Some(ref path) = self.state_file {
            state.save(path)?;
        }
        Ok(())
    }
}

/// Commit if every processor succeeded and nothing was recorded, else roll
/// back.
async fn finish_processors(
    tx: Box<dyn TargetTransaction>,
    outcome: Result<()>,
    errors: &ErrorLog,
    phase: &str,
) -> Result<()> {
    match outcome.and_then(|_| errors.check(phase)) {
        Ok(()) => tx.commit().await,
        Err(e) => {
            rollback(tx).await;
            Err(e)
        }
    }
}

async fn rollback(tx: Box<dyn TargetTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback failed: {}", e);
    }
}

fn remove_temp_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Unable to delete temporary file {:?}: {}", path, e);
    }
}

fn in_unit(unit: &str, error: MigrateError) -> MigrateError {
    match error {
        MigrateError::Config(message) => {
            MigrateError::Config(format!("unit '{}': {}", unit, message))
        }
        other => other,
    }
}

impl MigrationResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
