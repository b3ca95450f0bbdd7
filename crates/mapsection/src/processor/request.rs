use super::generator::{GeneratorProcessor, GeneratorWorkItem};
use super::pending::PendingRequestTable;
use super::persist::{PersistProcessor, PersistRequest};
use super::pool::WorkerSet;
use super::response::{ResponseProcessor, deliver};
use super::MapSectionWorkRequest;
use crate::{
    BacklogReservation, CancelledJobs, ComputeEngine, Error, FairJobQueue, JobBacklog,
    JobMapSectionLink, JobNumber, JobNumberSequence, MapSectionRequest, MapSectionResponse,
    MapSectionStore, OwnerRef, PipelineConfig, QueueError, RecordId, Result, TileKey, Unsatisfied,
    WorkAction, WorkItem, WorkItemId,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Entry point of the pipeline.
///
/// Requests are taken from a fair queue by a small pool of workers. Each one
/// is answered from the store when a good enough section is on file, and
/// otherwise handed to the [`GeneratorProcessor`], with concurrent requests for
/// the same tile collapsed into a single generation. Generated sections are
/// persisted by the [`PersistProcessor`] and every caller is answered through
/// the [`ResponseProcessor`].
///
/// Cloning is cheap; all clones drive the same pipeline. Call
/// [`stop`](Self::stop) before dropping the last clone so the workers exit.
#[derive(Clone)]
pub struct RequestProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn MapSectionStore>,
    use_repo: bool,
    queue: FairJobQueue<MapSectionWorkRequest>,
    backlog: JobBacklog,
    cancelled_jobs: CancelledJobs,
    pending: PendingRequestTable,
    generator: GeneratorProcessor,
    persist: PersistProcessor,
    response: ResponseProcessor,
    workers: WorkerSet,
    token: CancellationToken,
    job_numbers: JobNumberSequence,
}

impl RequestProcessor {
    /// Builds the pipeline and spawns every stage's workers. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate or no
    /// engine is given.
    pub fn new(
        store: Arc<dyn MapSectionStore>,
        engines: Vec<Arc<dyn ComputeEngine>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let token = CancellationToken::new();

        let generator = GeneratorProcessor::new(engines, &config, token.child_token())?;
        let persist = PersistProcessor::new(
            store.clone(),
            config.persist_queue_capacity,
            token.child_token(),
            config.stop_timeout,
        );
        let response = ResponseProcessor::new(
            config.response_queue_capacity,
            token.child_token(),
            config.stop_timeout,
        );

        let inner = Arc::new(Inner {
            store,
            use_repo: config.use_repo,
            queue: FairJobQueue::new(config.request_queue_capacity),
            backlog: JobBacklog::new(),
            cancelled_jobs: CancelledJobs::new(),
            pending: PendingRequestTable::new(),
            generator,
            persist,
            response,
            workers: WorkerSet::new("request", token.child_token(), config.stop_timeout),
            token,
            job_numbers: JobNumberSequence::new(),
        });

        for worker_id in 0..config.request_consumers {
            inner.workers.spawn(request_loop(worker_id, inner.clone()));
        }
        tracing::info!(
            request_consumers = config.request_consumers,
            generator_workers = inner.generator.worker_count(),
            use_repo = config.use_repo,
            "Map section pipeline started"
        );

        Ok(Self { inner })
    }

    /// Allocates a new job number.
    pub fn next_job_number(&self) -> JobNumber {
        self.inner.job_numbers.next()
    }

    /// Queues `request` for `job`, waiting while the request queue is full.
    ///
    /// `callback` runs once with the request and its response, and once more
    /// for the request's mirror if it has one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the pipeline is stopping. The
    /// callback has then already been invoked with a cancelled response.
    pub async fn add_work<F>(
        &self,
        job: JobNumber,
        request: MapSectionRequest,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(MapSectionRequest, MapSectionResponse) + Send + Sync + 'static,
    {
        let mut reservation = self.reserve_backlog(job, 1);
        self.add_reserved_work(&mut reservation, request, callback).await
    }

    /// Counts `count` requests of `job` as pending before they are queued.
    ///
    /// Feed them with [`add_reserved_work`](Self::add_reserved_work); each
    /// one leaves the backlog once it is in the request queue.
    pub fn reserve_backlog(&self, job: JobNumber, count: usize) -> BacklogReservation {
        self.inner.backlog.reserve(job, count)
    }

    /// [`add_work`](Self::add_work) for a request already counted in
    /// `reservation`, under the reservation's job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the pipeline is stopping.
    pub async fn add_reserved_work<F>(
        &self,
        reservation: &mut BacklogReservation,
        mut request: MapSectionRequest,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(MapSectionRequest, MapSectionResponse) + Send + Sync + 'static,
    {
        let job = reservation.job_number();
        request.job_number = job;
        if let Some(mirror) = request.mirror.as_deref_mut() {
            mirror.job_number = job;
        }
        let cancelled_jobs = self.inner.cancelled_jobs.clone();
        let item = WorkItem::new(job, request, WorkAction::shared(callback), cancelled_jobs);

        let added = self.inner.queue.add(item, self.inner.workers.token()).await;
        reservation.release(1);
        match added {
            Ok(()) => Ok(()),
            Err(rejected) => {
                tracing::warn!(job, "Request rejected: {}", rejected.error);
                let mut item = rejected.item;
                item.response = Some(MapSectionResponse::cancelled(&item.request));
                deliver(item).await;
                Err(Error::ServiceShutdown)
            }
        }
    }

    /// Answers what it can of `requests` straight from the store, without
    /// queueing anything.
    ///
    /// A request whose cached section satisfies it is marked found in repo
    /// and returned with its response, followed by its mirror if it has one;
    /// owners are linked to the section. Everything else is handed back in
    /// [`FetchedResponses::missing`] for [`add_work`](Self::add_work). Nothing
    /// is found when store reads are disabled or the job is cancelled.
    pub async fn fetch_responses(
        &self,
        job: JobNumber,
        requests: Vec<MapSectionRequest>,
    ) -> FetchedResponses {
        let mut fetched = FetchedResponses::default();
        if !self.inner.use_repo || self.is_job_cancelled(job) {
            fetched.missing = requests;
            return fetched;
        }

        for mut request in requests {
            request.job_number = job;
            if let Some(mirror) = request.mirror.as_deref_mut() {
                mirror.job_number = job;
            }
            let cached = match self.inner.lookup(&request).await {
                Some(cached) if cached.satisfies(request.target_iterations()).is_ok() => cached,
                _ => {
                    fetched.missing.push(request);
                    continue;
                }
            };

            request.found_in_repo = true;
            request.completed = true;
            request.processing_end_time = Some(Instant::now());
            if let Some(id) = &cached.map_section_id {
                self.inner.link_found(&request, id).await;
            }
            let mirror = request.take_mirror();
            if let Some(mirror) = mirror {
                let mirror_response = cached.for_mirror(&mirror);
                fetched.found.push((request, cached));
                fetched.found.push((mirror, mirror_response));
            } else {
                fetched.found.push((request, cached));
            }
        }

        tracing::debug!(
            job,
            found = fetched.found.len(),
            missing = fetched.missing.len(),
            "Fetched from repo"
        );
        fetched
    }

    /// Cancels `job` in this stage and in the generator.
    ///
    /// Queued requests of the job are answered with cancelled responses;
    /// engine calls already issued run to completion.
    pub fn cancel_job(&self, job: JobNumber) {
        tracing::info!(job, "Cancelling job");
        self.inner.cancelled_jobs.cancel(job);
        self.inner.generator.cancel_job(job);
    }

    pub fn is_job_cancelled(&self, job: JobNumber) -> bool {
        self.inner.cancelled_jobs.is_cancelled(job)
    }

    /// Forgets `job` in every stage's cancelled set.
    pub fn mark_job_as_complete(&self, job: JobNumber) {
        self.inner.cancelled_jobs.mark_complete(job);
        self.inner.generator.mark_job_as_complete(job);
    }

    /// Requests of `job` that have not been answered or handed to delivery,
    /// including reserved ones still waiting to be queued.
    pub fn get_number_of_pending_requests(&self, job: JobNumber) -> usize {
        self.inner.backlog.count_for_job(job)
            + self.inner.queue.len_for_job(job)
            + self.inner.pending.count_for_job(job)
    }

    /// Requests of every job that have not been answered or handed to
    /// delivery.
    pub fn number_of_requests_pending(&self) -> usize {
        self.inner.backlog.len() + self.inner.queue.len() + self.inner.pending.len()
    }

    pub fn use_repo(&self) -> bool {
        self.inner.use_repo
    }

    /// Stops every stage, upstream first.
    ///
    /// A graceful stop lets each stage finish its queued work, bounded by the
    /// configured stop timeout per stage. A hard stop cancels waits and
    /// in-flight engine calls; requests that never reached an engine are
    /// answered with cancelled responses.
    pub async fn stop(&self, immediately: bool) {
        let inner = &self.inner;
        tracing::info!(immediately, "Stopping map section pipeline");

        inner.queue.complete_adding();
        inner.workers.join(immediately).await;
        for mut item in inner.queue.drain() {
            item.response = Some(MapSectionResponse::cancelled(&item.request));
            deliver(item).await;
        }

        let abandoned = inner.generator.stop(immediately).await;
        if !abandoned.is_empty() {
            tracing::debug!(count = abandoned.len(), "Dropping unstarted generations");
        }
        for mut item in inner.pending.drain() {
            item.response = Some(MapSectionResponse::cancelled(&item.request));
            deliver(item).await;
        }

        inner.persist.stop(immediately).await;
        inner.response.stop(immediately).await;
        inner.token.cancel();
        tracing::info!("Map section pipeline stopped");
    }
}

/// The outcome of [`RequestProcessor::fetch_responses`].
#[derive(Debug, Default)]
pub struct FetchedResponses {
    /// Requests answered from the store, mirrors listed after their primary.
    pub found: Vec<(MapSectionRequest, MapSectionResponse)>,
    /// Requests that still need [`RequestProcessor::add_work`].
    pub missing: Vec<MapSectionRequest>,
}

async fn request_loop(worker_id: usize, inner: Arc<Inner>) -> Result<()> {
    tracing::trace!(worker_id, "Request worker started");
    loop {
        let item = match inner.queue.take(inner.workers.token()).await {
            Ok(item) => item,
            Err(QueueError::Cancelled | QueueError::Completed) => break,
            Err(e) => {
                tracing::error!(worker_id, "Request queue is corrupt: {e}");
                return Err(e.into());
            }
        };
        inner.process_request(item).await;
    }
    tracing::trace!(worker_id, "Request worker stopped");
    Ok(())
}

impl Inner {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            job = item.job_number(),
            request = item.request.request_number,
            tile = %item.request.tile_key()
        )
    )]
    async fn process_request(self: &Arc<Self>, mut item: MapSectionWorkRequest) {
        if item.job_is_cancelled() {
            item.response = Some(MapSectionResponse::cancelled(&item.request));
            self.send_to_response(item).await;
            return;
        }

        if !self.use_repo {
            self.queue_for_generation(item).await;
            return;
        }

        let fetched = self.lookup(&item.request).await;

        let Some(cached) = fetched else {
            self.queue_for_generation(item).await;
            return;
        };

        match cached.satisfies(item.request.target_iterations()) {
            Ok(()) => {
                tracing::debug!("Found in repo");
                item.request.found_in_repo = true;
                item.request.processing_end_time = Some(Instant::now());
                if let Some(id) = &cached.map_section_id {
                    self.link_found(&item.request, id).await;
                }
                item.response = Some(cached);
                self.send_to_response(item).await;
            }
            Err(reason) => {
                tracing::debug!(%reason, "Cached section needs more work");
                if let Some(vectors) = cached.vectors.as_deref() {
                    item.request.seed_from(vectors, cached.map_section_id.clone());
                }
                self.queue_for_generation(item).await;
            }
        }
    }

    /// Joins an in-flight generation for the item's tile, or starts one.
    async fn queue_for_generation(self: &Arc<Self>, item: MapSectionWorkRequest) {
        let key = item.request.tile_key();
        let job = item.job_number();
        let primary_id = item.id();

        let Some(request) = self
            .pending
            .register(key.clone(), item, |primary| primary.request.clone_for_generation())
        else {
            tracing::debug!(job, tile = %key, "Joined in-flight generation");
            return;
        };

        let on_generated = {
            let inner = self.clone();
            WorkAction::future(move |request, response| {
                inner.on_generated(primary_id, request, response)
            })
        };
        let generation: GeneratorWorkItem =
            WorkItem::new(job, request, on_generated, self.generator.cancelled_jobs());

        if let Err(rejected) = self.generator.add_work(generation).await {
            tracing::warn!(job, tile = %key, "Generation rejected: {}", rejected.error);
            self.cancel_waiters(&key).await;
        }
    }

    fn on_generated(
        self: Arc<Self>,
        primary_id: WorkItemId,
        request: MapSectionRequest,
        response: MapSectionResponse,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.handle_generated_response(primary_id, request, response).await })
    }

    /// Fans a generation outcome out to every request waiting on the tile.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(job = generated.job_number, tile = %generated.tile_key())
    )]
    async fn handle_generated_response(
        self: &Arc<Self>,
        primary_id: WorkItemId,
        generated: MapSectionRequest,
        response: MapSectionResponse,
    ) {
        let key = generated.tile_key();
        let waiters = self.pending.take_waiters(&key);
        if !waiters.iter().any(|w| w.id() == primary_id) {
            tracing::error!(
                primary_id,
                waiters = waiters.len(),
                "Primary request missing from its waiters"
            );
        }
        if waiters.is_empty() {
            return;
        }

        // Skipped because the primary's job was cancelled. Waiters from live
        // jobs still need the tile.
        if response.request_cancelled {
            let (cancelled, live): (Vec<_>, Vec<_>) =
                waiters.into_iter().partition(|w| w.job_is_cancelled());
            for mut waiter in cancelled {
                waiter.response = Some(response.clone());
                self.send_to_response(waiter).await;
            }
            self.requeue(live, None);
            return;
        }

        // Only waiters that asked for more than this generation's target are
        // refined; a short result at the same target is answered as is.
        let mut answered = Vec::with_capacity(waiters.len());
        let mut refine = Vec::new();
        for waiter in waiters {
            let target = waiter.request.target_iterations();
            let below_target = target > generated.target_iterations()
                && matches!(response.satisfies(target), Err(Unsatisfied::BelowTarget { .. }));
            if below_target && !waiter.job_is_cancelled() {
                refine.push(waiter);
            } else {
                answered.push(waiter);
            }
        }

        if self.use_repo && response.has_data() {
            let mut record = response.clone();
            if !refine.is_empty() {
                record.request_completed = false;
            }
            let owners = answered
                .iter()
                .filter(|w| !w.job_is_cancelled())
                .flat_map(|w| core::iter::once(&w.request).chain(w.request.mirror.as_deref()))
                .filter_map(OwnerRef::for_request)
                .collect();
            self.persist(PersistRequest::MapSection {
                response: record,
                owners,
            })
            .await;
        }

        for mut waiter in answered {
            waiter.request.sent = true;
            waiter.request.processing_start_time = generated.processing_start_time;
            waiter.request.generation_duration = generated.generation_duration;
            waiter.response = Some(response.clone());
            self.send_to_response(waiter).await;
        }

        if !refine.is_empty() {
            tracing::debug!(count = refine.len(), "Refining for higher targets");
            self.requeue(refine, Some(&response));
        }
    }

    /// Sends `waiters` back through deduplicated generation, seeded with
    /// `partial` when given.
    ///
    /// Runs on its own task: the caller may be a generator worker, and
    /// blocking it on the generator's own queue could deadlock the pool.
    fn requeue(
        self: &Arc<Self>,
        mut waiters: Vec<MapSectionWorkRequest>,
        partial: Option<&MapSectionResponse>,
    ) {
        if waiters.is_empty() {
            return;
        }
        if let Some(partial) = partial {
            if let Some(vectors) = partial.vectors.as_deref() {
                for waiter in &mut waiters {
                    waiter.request.seed_from(vectors, partial.map_section_id.clone());
                }
            }
        }
        let inner = self.clone();
        tokio::spawn(async move {
            for waiter in waiters {
                inner.queue_for_generation(waiter).await;
            }
        });
    }

    /// Reads the cached section for `request`'s tile. Store failures count as
    /// misses.
    async fn lookup(&self, request: &MapSectionRequest) -> Option<MapSectionResponse> {
        match self
            .store
            .fetch_tile(&request.subdivision_id, &request.block_position)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(
                    tile = %request.tile_key(),
                    "Store lookup failed, treating as a miss: {e}"
                );
                None
            }
        }
    }

    /// Links the owners of `request` and of its mirror to a section found on
    /// file.
    async fn link_found(&self, request: &MapSectionRequest, id: &RecordId) {
        let requests = core::iter::once(request).chain(request.mirror.as_deref());
        for link in requests.filter_map(|r| JobMapSectionLink::for_request(r, id.clone())) {
            self.persist(PersistRequest::JobLink { link }).await;
        }
    }

    /// Answers every request waiting on `key` with a cancelled response.
    async fn cancel_waiters(&self, key: &TileKey) {
        for mut waiter in self.pending.take_waiters(key) {
            waiter.response = Some(MapSectionResponse::cancelled(&waiter.request));
            self.send_to_response(waiter).await;
        }
    }

    async fn persist(&self, request: PersistRequest) {
        if let Err(e) = self.persist.add_work(request).await {
            tracing::warn!("Dropping store write: {e}");
        }
    }

    /// Routes `item` to the response stage, or delivers it inline if that
    /// stage is no longer accepting work.
    async fn send_to_response(&self, item: MapSectionWorkRequest) {
        if let Err(rejected) = self.response.add_work(item).await {
            tracing::debug!("Response stage closed, delivering inline: {}", rejected.error);
            deliver(rejected.item).await;
        }
    }
}
