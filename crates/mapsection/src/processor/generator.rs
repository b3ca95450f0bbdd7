use super::pool::WorkerSet;
use crate::{
    CancelledJobs, ComputeEngine, Error, FairJobQueue, JobNumber, MapSectionRequest,
    MapSectionResponse, PipelineConfig, QueueError, Rejected, Result, WorkItem,
};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A request handed to a compute engine, completed by an async action.
pub type GeneratorWorkItem = WorkItem<MapSectionRequest, MapSectionResponse>;

/// Remote engines get one worker for every this many local workers.
pub const REMOTE_WEIGHT: usize = 3;

/// Number of workers to run against each engine, in engine order.
///
/// Local engines share the machine with the pipeline: they get one worker per
/// core but one when `use_all_cores` is set, otherwise a single worker.
/// Remote engines get a third of the local count, and never fewer than one.
pub fn plan_workers(
    engine_locality: impl IntoIterator<Item = bool>,
    parallelism: usize,
    use_all_cores: bool,
) -> Vec<usize> {
    let local = if use_all_cores {
        parallelism.saturating_sub(1).max(1)
    } else {
        1
    };
    let remote = (local / REMOTE_WEIGHT).max(1);
    engine_locality
        .into_iter()
        .map(|is_local| if is_local { local } else { remote })
        .collect()
}

/// A pool of workers that pulls generation requests from a fair queue and
/// calls the configured compute engines.
///
/// Items of a cancelled job are answered with a cancelled response without
/// reaching an engine. Cancelling a job never interrupts a call that has
/// already been issued.
pub struct GeneratorProcessor {
    queue: Arc<FairJobQueue<GeneratorWorkItem>>,
    cancelled_jobs: CancelledJobs,
    workers: WorkerSet,
}

impl GeneratorProcessor {
    /// Spawns the worker pool. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `engines` is empty.
    pub fn new(
        engines: Vec<Arc<dyn ComputeEngine>>,
        config: &PipelineConfig,
        token: CancellationToken,
    ) -> Result<Self> {
        if engines.is_empty() {
            return Err(Error::InvalidConfig {
                reason: "at least one compute engine is required".to_string(),
            });
        }

        let queue = Arc::new(FairJobQueue::new(config.generator_queue_capacity));
        let workers = WorkerSet::new("generator", token, config.stop_timeout);
        let plan = plan_workers(
            engines.iter().map(|engine| engine.is_local()),
            config.parallelism(),
            config.use_all_cores,
        );

        let mut worker_id = 0;
        for (engine, count) in engines.into_iter().zip(plan) {
            tracing::info!(
                endpoint = engine.endpoint_address(),
                local = engine.is_local(),
                workers = count,
                "Starting generator workers"
            );
            for _ in 0..count {
                workers.spawn(generator_loop(
                    worker_id,
                    engine.clone(),
                    queue.clone(),
                    workers.token().clone(),
                ));
                worker_id += 1;
            }
        }

        Ok(Self {
            queue,
            cancelled_jobs: CancelledJobs::new(),
            workers,
        })
    }

    /// The cancelled-job set generation items must be created with.
    pub fn cancelled_jobs(&self) -> CancelledJobs {
        self.cancelled_jobs.clone()
    }

    /// Queues `item`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Hands the item back once the processor is stopping.
    pub async fn add_work(
        &self,
        item: GeneratorWorkItem,
    ) -> core::result::Result<(), Rejected<GeneratorWorkItem>> {
        self.queue.add(item, self.workers.token()).await
    }

    pub fn cancel_job(&self, job: JobNumber) {
        self.cancelled_jobs.cancel(job);
    }

    pub fn is_job_cancelled(&self, job: JobNumber) -> bool {
        self.cancelled_jobs.is_cancelled(job)
    }

    pub fn mark_job_as_complete(&self, job: JobNumber) {
        self.cancelled_jobs.mark_complete(job);
    }

    /// Items of `job` still waiting for a worker.
    pub fn len_for_job(&self, job: JobNumber) -> usize {
        self.queue.len_for_job(job)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops intake and waits for the workers.
    ///
    /// A graceful stop lets the workers finish everything queued; a hard stop
    /// cancels the shared token, which aborts queue waits and is passed on to
    /// running engine calls. Items left in the queue are returned.
    pub async fn stop(&self, immediately: bool) -> Vec<GeneratorWorkItem> {
        self.queue.complete_adding();
        self.workers.join(immediately).await;
        self.queue.drain()
    }
}

async fn generator_loop(
    worker_id: usize,
    engine: Arc<dyn ComputeEngine>,
    queue: Arc<FairJobQueue<GeneratorWorkItem>>,
    token: CancellationToken,
) -> Result<()> {
    tracing::trace!(worker_id, endpoint = engine.endpoint_address(), "Generator worker started");

    loop {
        let mut item = match queue.take(&token).await {
            Ok(item) => item,
            Err(QueueError::Cancelled | QueueError::Completed) => break,
            Err(e) => {
                tracing::error!(worker_id, "Generator queue is corrupt: {e}");
                return Err(e.into());
            }
        };

        let response = generate(worker_id, engine.as_ref(), &mut item, &token).await;
        item.run_work_action(response).await;
    }

    tracing::trace!(worker_id, "Generator worker stopped");
    Ok(())
}

#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(worker_id = worker_id, job = item.job_number(), tile = %item.request.tile_key())
)]
async fn generate(
    worker_id: usize,
    engine: &dyn ComputeEngine,
    item: &mut GeneratorWorkItem,
    token: &CancellationToken,
) -> MapSectionResponse {
    if item.job_is_cancelled() {
        tracing::debug!("Job is cancelled, skipping generation");
        return MapSectionResponse::cancelled(&item.request);
    }

    item.request.processing_start_time = Some(Instant::now());
    item.request.sent = true;

    let started = Instant::now();
    let result = engine.generate(&mut item.request, token).await;
    item.request.generation_duration = Some(started.elapsed());

    match result {
        Ok(response) => {
            tracing::debug!(
                elapsed = ?item.request.generation_duration,
                completed = response.request_completed,
                "Generated map section"
            );
            response
        }
        Err(e) => {
            tracing::error!(endpoint = engine.endpoint_address(), "Compute engine failed: {e}");
            MapSectionResponse::empty(&item.request)
        }
    }
}
