//! caseflow-worker: runs the job executor against an in-memory engine.
//!
//! Loads every case model in `--definitions`, optionally starts cases, then
//! polls for due timers and jobs until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use caseflow_core::definition::yaml::load_case_dir;
use caseflow_core::job::JobExecutor;
use caseflow_core::{CaseEngine, EngineConfig, EngineRegistry, MemoryDefinitionProvider, MemoryStore};

/// Case job worker
#[derive(Parser, Debug)]
#[command(name = "caseflow-worker")]
#[command(about = "Run caseflow timers and async jobs")]
struct Args {
    /// Engine configuration file (YAML). Defaults apply when absent.
    #[arg(long, short = 'c', env = "CASEFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of case models (*.yaml, *.yml)
    #[arg(long, short = 'd', env = "CASEFLOW_DEFINITIONS")]
    definitions: PathBuf,

    /// Overrides `node_id` from the configuration
    #[arg(long, env = "CASEFLOW_NODE_ID")]
    node_id: Option<String>,

    /// Start one case of this definition key on boot (repeatable)
    #[arg(long = "start", short = 's')]
    start: Vec<String>,

    /// Run a single polling cycle and exit
    #[arg(long)]
    once: bool,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caseflow_core=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let provider = Arc::new(MemoryDefinitionProvider::new());
    let models = load_case_dir(&args.definitions)?;
    for def in models {
        let deployed = provider.deploy(def)?;
        tracing::info!(key = %deployed.key, version = deployed.version, "Deployed case model");
    }

    tracing::info!(node_id = %config.node_id, "Starting caseflow-worker");
    let registry = EngineRegistry::builder(provider, Arc::new(MemoryStore::new()))
        .config(config)
        .build();
    let engine = CaseEngine::new(registry.clone());

    for key in &args.start {
        let case_id = engine
            .start_case(key, Default::default())
            .await
            .with_context(|| format!("Starting case '{}'", key))?;
        tracing::info!(case_id = %case_id, definition = %key, "Case started on boot");
    }

    let executor = Arc::new(JobExecutor::new(registry));
    if args.once {
        let count = executor.run_once().await?;
        tracing::info!(count, "Single cycle done");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Ctrl-C received, stopping");
        let _ = shutdown_tx.send(true);
    });

    executor.run(shutdown_rx).await;
    Ok(())
}
