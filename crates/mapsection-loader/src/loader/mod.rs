//! Components of the `mapsection-loader` binary.
//!
//! - [`config`] - CLI / environment configuration.
//! - [`job`] - Screen layout and request construction.
//! - [`telemetry`] - Logging and optional OpenTelemetry export.

pub mod config;
pub mod job;
pub mod telemetry;

use config::LoaderConfig;
use futures::future::join_all;
use mapsection::{JobHandle, JobNumber, JobSummary, MapSectionProvider};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs every configured pass in order and returns the job summaries.
///
/// Cancelling `token` cancels the jobs in flight; they still complete, with
/// their remaining tiles answered as cancelled, and later passes are skipped.
pub async fn run_passes(
    provider: &MapSectionProvider,
    config: &LoaderConfig,
    token: &CancellationToken,
) -> Vec<JobSummary> {
    let mut summaries = Vec::new();
    for (pass, &target) in config.targets.iter().enumerate() {
        if token.is_cancelled() {
            tracing::warn!(pass, "Skipping remaining passes");
            break;
        }
        tracing::info!(
            pass,
            target,
            tiles = config.screen.tile_count(),
            jobs = config.duplicate_jobs + 1,
            "Starting pass"
        );
        let handles: Vec<_> = (0..=config.duplicate_jobs)
            .map(|_| submit(provider, config, target))
            .collect();
        summaries.extend(await_jobs(provider, handles, config.progress_interval, token).await);
    }
    summaries
}

fn submit(provider: &MapSectionProvider, config: &LoaderConfig, target: u32) -> JobHandle {
    let job = provider.next_job_number();
    telemetry::increment_jobs_inflight();
    provider.submit(
        job,
        config.screen.requests(job, target),
        |request, response| {
            if response.request_cancelled {
                telemetry::increment_tiles_cancelled();
            } else {
                telemetry::increment_tiles_delivered(request.found_in_repo);
            }
        },
        |summary| {
            telemetry::decrement_jobs_inflight();
            telemetry::record_job_duration(summary.elapsed.as_secs_f64() * 1000.0);
        },
    )
}

async fn await_jobs(
    provider: &MapSectionProvider,
    handles: Vec<JobHandle>,
    interval: Duration,
    token: &CancellationToken,
) -> Vec<JobSummary> {
    let jobs: Vec<(JobNumber, usize)> =
        handles.iter().map(|h| (h.job_number(), h.submitted())).collect();
    let waits = join_all(handles.into_iter().map(JobHandle::wait));
    tokio::pin!(waits);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut cancelled = false;
    let results = loop {
        tokio::select! {
            results = &mut waits => break results,
            () = token.cancelled(), if !cancelled => {
                cancelled = true;
                for &(job, _) in &jobs {
                    provider.cancel(job);
                }
            }
            _ = ticker.tick() => report_progress(provider, &jobs),
        }
    };

    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::error!("Job did not complete: {e}");
                None
            }
        })
        .collect()
}

fn report_progress(provider: &MapSectionProvider, jobs: &[(JobNumber, usize)]) {
    for &(job, submitted) in jobs {
        let pending = provider.pending_count(job);
        tracing::info!(job, pending, submitted, "Job progress");
    }
}
