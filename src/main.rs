use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use volley_worker::cli::config::Config;
use volley_worker::cli::{Cli, Commands};
use volley_worker::engine::control::TaskControl;
use volley_worker::engine::task::TestCase;
use volley_worker::{ConnectionManager, LoadGenerator, WorkerContext};

/// Cancelled on the first Ctrl-C.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
        }
        token_clone.cancel();
    });

    token
}

async fn run_worker(config_path: std::path::PathBuf) -> Result<()> {
    let config = Config::load(&config_path)?;
    info!(
        "Loaded config from {} (controller {}, retry every {:?})",
        config_path.display(),
        config.controller_url(),
        config.retry_interval()
    );

    let manager = ConnectionManager::new(WorkerContext::new(config));
    manager.run(install_shutdown_handler()).await;
    Ok(())
}

async fn run_exec(testcase: std::path::PathBuf, config_path: Option<std::path::PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let content = tokio::fs::read_to_string(&testcase)
        .await
        .with_context(|| format!("Failed to read test case {}", testcase.display()))?;
    let task: TestCase = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test case {}", testcase.display()))?;

    let generator = LoadGenerator::new(&WorkerContext::new(config));
    let control = Arc::new(TaskControl::new());

    let shutdown = install_shutdown_handler();
    let stop_on_shutdown = control.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        stop_on_shutdown.stop();
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let print = async {
        while let Some(result) = rx.recv().await {
            println!("{}", serde_json::to_string(&result)?);
        }
        Ok::<_, anyhow::Error>(())
    };
    let (summary, printed) = tokio::join!(generator.run(Arc::new(task), control, tx), print);
    printed?;

    info!(
        "{} results from {} batches in {:?}",
        summary.results, summary.batches, summary.elapsed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let outcome = match cli.command {
        Commands::Worker { config } => run_worker(config).await,
        Commands::Exec { testcase, config } => run_exec(testcase, config).await,
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
