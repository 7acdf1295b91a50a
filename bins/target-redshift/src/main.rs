//! # target-redshift
//!
//! CLI wrapper around the streaming ingest engine in `redshift-io`.
//! Everything here is deliberately thin (per spec.md §1, this wrapper
//! is an "external collaborator" relative to the core engine): parse
//! arguments, load the config file, wire up the real S3 client and
//! Postgres connection pool, install signal handling, and translate
//! the engine's outcome into an exit code.
//!
//! ```bash
//! target-redshift --config config.json < messages.jsonl
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use redshift_core::config::Config;
use redshift_core::error::TargetError;
use redshift_io::{Engine, EngineExit, PgWarehouse, S3StagingStore};

/// Streaming ingest target: loads a tap's line-delimited record
/// protocol on stdin into Redshift via an S3 staging area.
#[derive(Parser, Debug)]
#[command(name = "target-redshift")]
#[command(about = "Tap-to-target streaming ingest engine for Redshift")]
struct Args {
    /// Path to the JSON config file (§6's configuration table).
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(EngineExit::Clean) => ExitCode::from(0),
        Ok(EngineExit::Signalled) => ExitCode::from(130),
        Err(e) => {
            error!(error = %e, "target-redshift exiting with error");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(err: &TargetError) -> u8 {
    err.exit_code().clamp(0, 255) as u8
}

async fn run() -> redshift_core::error::Result<EngineExit> {
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config).map_err(|e| TargetError::Fatal(e.into()))?;
    let config: Config = serde_json::from_str(&raw).map_err(|e| TargetError::Fatal(e.into()))?;
    let config = Arc::new(config);

    let warehouse = Arc::new(PgWarehouse::connect(&config).await?);
    let staging = Arc::new(S3StagingStore::from_config(&config)?);

    let engine = Engine::new(config.clone(), warehouse, staging);
    engine.prime_catalog(&referenced_schemas(&config)).await?;

    let shutdown = CancellationToken::new();
    let signal_task = spawn_signal_listener(shutdown.clone());

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let exit = engine.run(stdin, stdout, shutdown).await;

    signal_task.abort();
    match &exit {
        Ok(EngineExit::Clean) => info!("engine exited cleanly"),
        Ok(EngineExit::Signalled) => info!("engine exited on signal"),
        Err(e) => error!(error = %e, "engine exited with an error"),
    }
    exit
}

/// Every target schema this run's config could write to: the default
/// plus every `schema_mapping` override, so the catalog cache can be
/// primed once up front (§4.5) instead of per-stream.
fn referenced_schemas(config: &Config) -> Vec<String> {
    let mut schemas = vec![config.default_target_schema.clone()];
    for mapping in config.schema_mapping.values() {
        if let Some(schema) = &mapping.target_schema {
            if !schemas.contains(schema) {
                schemas.push(schema.clone());
            }
        }
    }
    schemas
}

/// Listen for SIGINT/SIGTERM and cancel `shutdown` on either (§5).
/// Returns the listener's task handle so the caller can abort it once
/// the engine has already exited on its own.
fn spawn_signal_listener(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("caught SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("caught SIGINT"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("caught ctrl-c");
        }
        shutdown.cancel();
    })
}
