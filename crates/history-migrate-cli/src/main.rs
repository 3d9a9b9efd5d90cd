//! history-migrate CLI - replay and rewrite the history of a versioned object store.

use clap::{Parser, Subcommand};
use history_migrate::orchestrator::{dump_store, transform_dump, MigrationPlan};
use history_migrate::processors::ProcessorRegistry;
use history_migrate::sink::ScriptReader;
use history_migrate::{
    Config, MigrateError, Orchestrator, PostgresStore, StageRegistry, TargetStore,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "history-migrate")]
#[command(about = "Replay and rewrite the revision history of a versioned object store")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "migration.yaml")]
    config: PathBuf,

    /// Path to the run journal
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to wait for the current phase after a shutdown signal (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration against the configured store
    Run {
        /// Override target schema
        #[arg(long)]
        target_schema: Option<String>,

        /// Dry run: dump and transform, but do not write to the store
        #[arg(long)]
        dry_run: bool,
    },

    /// Write the store's history to a dump file
    Dump {
        /// Output dump file (gzip JSON Lines)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Transform a dump file into a load script, offline
    Transform {
        /// Input dump file
        #[arg(long)]
        dump: PathBuf,

        /// Output load script
        #[arg(long)]
        script: PathBuf,
    },

    /// Print a load script as SQL
    RenderSql {
        /// Load script to render
        #[arg(long)]
        script: PathBuf,
    },

    /// Validate the configuration and print the migration plan
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            target_schema,
            dry_run,
        } => {
            if let Some(schema) = target_schema {
                config.target.schema = schema;
            }

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(cli.shutdown_timeout);

            let mut orchestrator = Orchestrator::new(config)
                .await?
                .with_cancellation(cancel_token);
            if let Some(ref path) = cli.state_file {
                orchestrator = orchestrator.with_state_file(path.clone());
            }

            let result = orchestrator.run(dry_run).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                let status_msg = if dry_run {
                    "Dry run completed!"
                } else {
                    "Migration completed!"
                };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Stages: {}", result.plan.stages.join(", "));
                println!(
                    "  Revisions: {} read, {} written",
                    result.revisions_read, result.revisions_written
                );
                println!("  Rows loaded: {}", result.rows_loaded);
            }
        }

        Commands::Dump { output } => {
            let types = config.type_directory()?;
            let store = PostgresStore::connect(&config.target).await?;
            let window = config.migration.read_window;
            let summary = dump_store(&store, &types, &output, window).await;
            store.close().await;
            let summary = summary?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Dumped {} records ({} rows) to {:?}",
                    summary.records, summary.rows_read, output
                );
            }
        }

        Commands::Transform { dump, script } => {
            let types = config.type_directory()?;
            let registry = StageRegistry::with_builtins();
            let summary = tokio::task::spawn_blocking(move || {
                transform_dump(&config, &types, &registry, &dump, &script)
            })
            .await
            .map_err(|e| MigrateError::Io(std::io::Error::other(e)))??;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.pipeline.summary());
                println!(
                    "Script: {} revisions, {} rows in {} entries",
                    summary.script.revisions, summary.script.rows, summary.script.entries
                );
            }
            summary.errors.check("transform")?;
        }

        Commands::RenderSql { script } => {
            for entry in ScriptReader::open(&script)? {
                println!("{};", entry?.to_sql(&config.target.schema));
            }
        }

        Commands::CheckConfig => {
            let plan = MigrationPlan::build(
                &config,
                &StageRegistry::with_builtins(),
                &ProcessorRegistry::with_builtins(),
            )?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Configuration OK");
                println!("  Units: {}", config.units.len());
                println!("  Stages: {}", plan.stages.join(", "));
                println!("  Schema processors: {}", plan.schema_processors.len());
                println!("  Post processors: {}", plan.post_processors.len());
                println!(
                    "  Replay required: {}",
                    if plan.replay_required { "yes" } else { "no" }
                );
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. The run stops at the next
/// phase boundary; if it has not stopped after `shutdown_timeout` seconds the
/// process exits.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!(
                        "\nReceived {}. Stopping after the current phase (timeout: {}s)...",
                        name, shutdown_timeout
                    );
                    token.cancel();
                    exit_after(shutdown_timeout).await;
                });
            }
            Err(e) => warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current phase...");
            token.cancel();
            exit_after(shutdown_timeout).await;
        }
    });

    cancel_token
}

async fn exit_after(shutdown_timeout: u64) {
    tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    eprintln!("Shutdown timeout exceeded, exiting");
    std::process::exit(i32::from(MigrateError::Cancelled.exit_code()));
}
