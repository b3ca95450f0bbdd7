#![doc = include_str!("../README.md")]

mod loader;

use clap::Parser;
use loader::config::{CliArgs, LoaderConfig};
use loader::run_passes;
use loader::telemetry::init_telemetry;
use mapsection::{InMemoryMapSectionStore, LocalEngine, MapSectionProvider};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = LoaderConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let provider = MapSectionProvider::new(
        Arc::new(InMemoryMapSectionStore::new()),
        vec![Arc::new(LocalEngine::new())],
        config.pipeline.clone(),
    )?;

    let token = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(token.clone()));

    let started = Instant::now();
    let summaries = run_passes(&provider, &config, &token).await;
    let interrupted = token.is_cancelled();
    signal_task.abort();

    provider.shutdown(interrupted).await;

    for summary in &summaries {
        tracing::info!(
            job = summary.job_number,
            submitted = summary.submitted,
            completed = summary.completed,
            cancelled = summary.cancelled,
            found_in_repo = summary.found_in_repo,
            elapsed = ?summary.elapsed,
            "Job summary"
        );
    }
    tracing::info!(elapsed = ?started.elapsed(), interrupted, "Loader finished");

    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &LoaderConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting loader with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting loader: {}x{} blocks of {} at targets {:?} with {} generator workers",
            config.screen.columns,
            config.screen.rows,
            config.screen.block_size,
            config.targets,
            config.pipeline.parallelism()
        );
    }
}

/// Cancels `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, cancelling jobs in flight...");
    token.cancel();
}
