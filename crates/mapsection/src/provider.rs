use crate::processor::panic_message;
use crate::{
    ComputeEngine, Error, JobNumber, MapSectionRequest, MapSectionResponse, MapSectionStore,
    PipelineConfig, RequestProcessor, Result,
};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Final counts for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    pub job_number: JobNumber,
    pub submitted: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub found_in_repo: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
struct JobProgress {
    job_number: JobNumber,
    submitted: usize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    found_in_repo: AtomicUsize,
    remaining: AtomicUsize,
    started: Instant,
}

impl JobProgress {
    fn new(job_number: JobNumber, submitted: usize) -> Self {
        Self {
            job_number,
            submitted,
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            found_in_repo: AtomicUsize::new(0),
            remaining: AtomicUsize::new(submitted),
            started: Instant::now(),
        }
    }

    fn record(&self, request: &MapSectionRequest, response: &MapSectionResponse) {
        if response.request_cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
            if request.found_in_repo {
                self.found_in_repo.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            job_number: self.job_number,
            submitted: self.submitted,
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            found_in_repo: self.found_in_repo.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

type JobCompleteCallback = Box<dyn FnOnce(JobSummary) + Send>;

/// Fires the job's completion exactly once, when its last tile is delivered.
struct JobTracker {
    progress: Arc<JobProgress>,
    processor: RequestProcessor,
    on_complete: Mutex<Option<JobCompleteCallback>>,
    done: Mutex<Option<oneshot::Sender<JobSummary>>>,
}

impl JobTracker {
    fn tile_done(&self) {
        if self.progress.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let summary = self.progress.summary();
        self.processor.mark_job_as_complete(summary.job_number);
        tracing::info!(
            job = summary.job_number,
            completed = summary.completed,
            cancelled = summary.cancelled,
            found_in_repo = summary.found_in_repo,
            elapsed = ?summary.elapsed,
            "Job complete"
        );

        // May run while a tile callback is unwinding.
        let on_complete = self.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || on_complete(summary))) {
                tracing::error!(
                    job = summary.job_number,
                    "Job completion callback panicked: {}",
                    panic_message(&*panic)
                );
            }
        }
        let done = self.done.lock().take();
        if let Some(done) = done {
            let _ = done.send(summary);
        }
    }
}

/// Counts a tile as delivered when dropped, even if the tile callback panics.
struct TileDone<'a>(&'a JobTracker);

impl Drop for TileDone<'_> {
    fn drop(&mut self) {
        self.0.tile_done();
    }
}

/// A submitted job: live progress and a way to wait for completion.
#[derive(Debug)]
pub struct JobHandle {
    progress: Arc<JobProgress>,
    done: oneshot::Receiver<JobSummary>,
}

impl JobHandle {
    pub fn job_number(&self) -> JobNumber {
        self.progress.job_number
    }

    pub fn submitted(&self) -> usize {
        self.progress.submitted
    }

    pub fn completed(&self) -> usize {
        self.progress.completed.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> usize {
        self.progress.cancelled.load(Ordering::Relaxed)
    }

    pub fn found_in_repo(&self) -> usize {
        self.progress.found_in_repo.load(Ordering::Relaxed)
    }

    /// Tiles not yet delivered.
    pub fn remaining(&self) -> usize {
        self.progress.remaining.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    pub fn elapsed(&self) -> Duration {
        self.progress.started.elapsed()
    }

    /// Waits until every tile of the job has been delivered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the job can no longer complete.
    pub async fn wait(self) -> Result<JobSummary> {
        self.done.await.map_err(|_| Error::ChannelError {
            context: format!("job {} was dropped before completing", self.progress.job_number),
        })
    }
}

/// The pipeline as seen by the job-orchestration layer.
///
/// Submitting a job returns immediately; tiles are fed to the pipeline in the
/// background and delivered one by one to `on_tile_ready`. `on_job_complete`
/// runs once after the last tile, cancelled or not.
#[derive(Clone)]
pub struct MapSectionProvider {
    processor: RequestProcessor,
}

impl MapSectionProvider {
    /// Starts a pipeline. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the pipeline cannot be built.
    pub fn new(
        store: Arc<dyn MapSectionStore>,
        engines: Vec<Arc<dyn ComputeEngine>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        Ok(Self {
            processor: RequestProcessor::new(store, engines, config)?,
        })
    }

    pub fn from_processor(processor: RequestProcessor) -> Self {
        Self { processor }
    }

    pub const fn processor(&self) -> &RequestProcessor {
        &self.processor
    }

    pub fn next_job_number(&self) -> JobNumber {
        self.processor.next_job_number()
    }

    /// Submits `requests` under `job`.
    ///
    /// Tiles already on file are answered first, straight from the store; the
    /// rest are queued. Mirrors count as tiles of their own.
    pub fn submit<T, C>(
        &self,
        job: JobNumber,
        requests: Vec<MapSectionRequest>,
        on_tile_ready: T,
        on_job_complete: C,
    ) -> JobHandle
    where
        T: Fn(MapSectionRequest, MapSectionResponse) + Send + Sync + 'static,
        C: FnOnce(JobSummary) + Send + 'static,
    {
        let tiles: usize = requests.iter().map(MapSectionRequest::response_count).sum();
        let progress = Arc::new(JobProgress::new(job, tiles));
        let (done_tx, done_rx) = oneshot::channel();
        let on_job_complete: JobCompleteCallback = Box::new(on_job_complete);
        let tracker = Arc::new(JobTracker {
            progress: progress.clone(),
            processor: self.processor.clone(),
            on_complete: Mutex::new(Some(on_job_complete)),
            done: Mutex::new(Some(done_tx)),
        });
        let handle = JobHandle {
            progress,
            done: done_rx,
        };

        if tiles == 0 {
            tracker.finish();
            return handle;
        }

        tracing::info!(job, tiles, "Submitting job");
        let processor = self.processor.clone();
        let mut backlog = processor.reserve_backlog(job, requests.len());
        let tile_ready = Arc::new(move |request: MapSectionRequest, response: MapSectionResponse| {
            tracker.progress.record(&request, &response);
            let _done = TileDone(&tracker);
            on_tile_ready(request, response);
        });
        tokio::spawn(async move {
            let submitted = requests.len();
            let fetched = processor.fetch_responses(job, requests).await;
            backlog.release(submitted - fetched.missing.len());
            for (request, response) in fetched.found {
                let delivered = catch_unwind(AssertUnwindSafe(|| tile_ready(request, response)));
                if let Err(panic) = delivered {
                    tracing::error!(job, "Tile callback panicked: {}", panic_message(&*panic));
                }
            }

            for request in fetched.missing {
                let tile_ready = tile_ready.clone();
                let callback = move |request: MapSectionRequest, response: MapSectionResponse| {
                    tile_ready(request, response);
                };
                if let Err(e) = processor.add_reserved_work(&mut backlog, request, callback).await {
                    tracing::debug!(job, "Tile answered without queueing: {e}");
                }
            }
        });

        handle
    }

    /// Cancels `job`. Its outstanding tiles are answered as cancelled.
    pub fn cancel(&self, job: JobNumber) {
        self.processor.cancel_job(job);
    }

    /// Requests of `job` not yet handed to delivery: waiting to be queued,
    /// queued, or waiting on a generation. A mirror rides with its request
    /// and is not counted separately.
    pub fn pending_count(&self, job: JobNumber) -> usize {
        self.processor.get_number_of_pending_requests(job)
    }

    /// Stops the pipeline; see [`RequestProcessor::stop`].
    pub async fn shutdown(&self, immediately: bool) {
        self.processor.stop(immediately).await;
    }
}
