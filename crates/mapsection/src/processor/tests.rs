use super::*;
use crate::{
    BigVector, ComputeEngine, EngineError, Error, InMemoryMapSectionStore, JobNumber,
    MapCalcSettings, MapSectionProvider, MapSectionRequest, MapSectionResponse, MapSectionStore,
    MapSectionVectors, OwnerType, PipelineConfig, RPoint, RSize, RValue, RecordId, SizeInt,
    StoreError, SubdivisionId,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

/// Engine double that counts calls, optionally blocks until released, and
/// echoes the requested settings back as achieved.
#[derive(Default)]
struct MockEngine {
    calls: AtomicUsize,
    seeded_calls: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    fail: bool,
}

impl MockEngine {
    fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let engine = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (Arc::new(engine), gate)
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeEngine for MockEngine {
    fn endpoint_address(&self) -> &str {
        "localhost"
    }

    async fn generate(
        &self,
        request: &mut MapSectionRequest,
        token: &CancellationToken,
    ) -> Result<MapSectionResponse, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.vectors.is_some() {
            self.seeded_calls.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gate) = &self.gate {
            tokio::select! {
                permit = gate.acquire() => permit.unwrap().forget(),
                () = token.cancelled() => return Err(EngineError::Cancelled),
            }
        }
        if self.fail {
            return Err(EngineError::Failed {
                reason: "boom".to_string(),
            });
        }
        let vectors = request
            .vectors
            .take()
            .unwrap_or_else(|| MapSectionVectors::new(request.block_size));
        Ok(MapSectionResponse::new(
            request,
            request.map_calc_settings,
            vectors,
            true,
        ))
    }
}

/// Store double whose reads always fail.
#[derive(Default)]
struct BrokenStore {
    inner: InMemoryMapSectionStore,
}

#[async_trait]
impl MapSectionStore for BrokenStore {
    async fn fetch_tile(
        &self,
        _subdivision_id: &SubdivisionId,
        _block_position: &BigVector,
    ) -> Result<Option<MapSectionResponse>, StoreError> {
        Err(StoreError::Backend {
            reason: "offline".to_string(),
        })
    }

    async fn save_tile(&self, response: &MapSectionResponse) -> Result<RecordId, StoreError> {
        self.inner.save_tile(response).await
    }

    async fn update_tile(
        &self,
        id: &RecordId,
        response: &MapSectionResponse,
    ) -> Result<(), StoreError> {
        self.inner.update_tile(id, response).await
    }

    async fn save_job_link(&self, link: &crate::JobMapSectionLink) -> Result<(), StoreError> {
        self.inner.save_job_link(link).await
    }
}

type Delivered = (MapSectionRequest, MapSectionResponse);

fn config() -> PipelineConfig {
    // One local generator worker keeps generation order predictable.
    PipelineConfig {
        parallelism: Some(2),
        stop_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

fn tile(job: JobNumber, x: i64, target: u32) -> MapSectionRequest {
    MapSectionRequest::new(
        job,
        usize::try_from(x).unwrap_or_default(),
        SubdivisionId::from("sub"),
        BigVector::new(x, 0),
        RPoint::default(),
        RSize::square(RValue::new(1, -8)),
        MapCalcSettings::new(target),
    )
    .with_block_size(SizeInt::new(4, 4))
}

/// `tile(job, x, target)` with an owner, mirrored onto row -1.
fn mirrored(job: JobNumber, x: i64, target: u32) -> MapSectionRequest {
    let mirror = MapSectionRequest::new(
        job,
        0,
        SubdivisionId::from("sub"),
        BigVector::new(x, -1),
        RPoint::default(),
        RSize::square(RValue::new(1, -8)),
        MapCalcSettings::new(target),
    )
    .with_block_size(SizeInt::new(4, 4))
    .with_owner("mirror-owner", OwnerType::Project);
    tile(job, x, target)
        .with_owner("owner", OwnerType::Project)
        .with_mirror(mirror)
}

fn pipeline(store: Arc<dyn MapSectionStore>, engine: Arc<dyn ComputeEngine>) -> RequestProcessor {
    RequestProcessor::new(store, vec![engine], config()).unwrap()
}

async fn submit(
    processor: &RequestProcessor,
    request: MapSectionRequest,
    tx: &mpsc::UnboundedSender<Delivered>,
) -> crate::Result<()> {
    let tx = tx.clone();
    processor
        .add_work(request.job_number, request, move |req, resp| {
            let _ = tx.send((req, resp));
        })
        .await
}

async fn receive(rx: &mut mpsc::UnboundedReceiver<Delivered>, n: usize) -> Vec<Delivered> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let next = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a response")
            .expect("response channel closed");
        out.push(next);
    }
    out
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Occupies the single generator worker until the gate is opened.
async fn block_generator(
    processor: &RequestProcessor,
    engine: &MockEngine,
    tx: &mpsc::UnboundedSender<Delivered>,
) {
    submit(processor, tile(1000, -1, 10), tx).await.unwrap();
    wait_until(|| engine.calls() == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coincident_requests_share_one_generation() {
    let (engine, gate) = MockEngine::gated();
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store, engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for job in [1, 2, 1, 2, 1] {
        submit(&processor, tile(job, 7, 100), &tx).await.unwrap();
    }
    wait_until(|| processor.number_of_requests_pending() == 5).await;
    assert_eq!(processor.get_number_of_pending_requests(1), 3);
    assert_eq!(processor.get_number_of_pending_requests(2), 2);

    gate.add_permits(1);
    let delivered = receive(&mut rx, 5).await;

    assert_eq!(engine.calls(), 1);
    let first = delivered[0].1.vectors.clone().unwrap();
    for (request, response) in &delivered {
        assert!(!response.request_cancelled);
        assert!(request.completed);
        assert!(Arc::ptr_eq(response.vectors.as_ref().unwrap(), &first));
    }
    assert_eq!(delivered.iter().filter(|(r, _)| r.pending).count(), 4);
    assert_eq!(processor.number_of_requests_pending(), 0);

    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_job_is_answered_without_generation() {
    let (engine, gate) = MockEngine::gated();
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    block_generator(&processor, &engine, &tx).await;
    for x in 1..=4 {
        submit(&processor, tile(2, x, 100), &tx).await.unwrap();
    }
    wait_until(|| processor.get_number_of_pending_requests(2) == 4).await;

    processor.cancel_job(2);
    gate.add_permits(10);

    let delivered = receive(&mut rx, 5).await;
    let cancelled: Vec<_> = delivered.iter().filter(|(r, _)| r.job_number == 2).collect();
    assert_eq!(cancelled.len(), 4);
    assert!(cancelled.iter().all(|(_, resp)| resp.request_cancelled && !resp.has_data()));
    assert_eq!(engine.calls(), 1);

    processor.stop(false).await;
    // Only the blocker was persisted.
    assert_eq!(store.section_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_queued_after_cancellation_are_answered_as_cancelled() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store, engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    processor.cancel_job(5);
    assert!(processor.is_job_cancelled(5));
    for x in 0..3 {
        submit(&processor, tile(5, x, 100), &tx).await.unwrap();
    }
    let delivered = receive(&mut rx, 3).await;
    assert!(delivered.iter().all(|(_, resp)| resp.request_cancelled));
    assert_eq!(engine.calls(), 0);

    processor.mark_job_as_complete(5);
    assert!(!processor.is_job_cancelled(5));
    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn live_waiters_survive_a_cancelled_primary() {
    let (engine, gate) = MockEngine::gated();
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store, engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    block_generator(&processor, &engine, &tx).await;
    submit(&processor, tile(1, 3, 100), &tx).await.unwrap();
    wait_until(|| processor.get_number_of_pending_requests(1) == 1).await;
    submit(&processor, tile(2, 3, 100), &tx).await.unwrap();
    wait_until(|| processor.get_number_of_pending_requests(2) == 1).await;

    processor.cancel_job(1);
    gate.add_permits(10);

    let delivered = receive(&mut rx, 3).await;
    let (_, job1) = delivered.iter().find(|(r, _)| r.job_number == 1).unwrap();
    let (_, job2) = delivered.iter().find(|(r, _)| r.job_number == 2).unwrap();
    assert!(job1.request_cancelled);
    assert!(!job2.request_cancelled);
    assert!(job2.has_data());
    assert_eq!(engine.calls(), 2);

    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_hits_bypass_the_engine_and_link_owners() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let cached = tile(0, 9, 1000);
    let id = store.insert(MapSectionResponse::new(
        &cached,
        MapCalcSettings::new(1000),
        MapSectionVectors::new(SizeInt::new(4, 4)),
        true,
    ));
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let request = tile(3, 9, 500).with_owner("project-a", OwnerType::Project);
    submit(&processor, request, &tx).await.unwrap();
    let delivered = receive(&mut rx, 1).await;
    let (request, response) = &delivered[0];

    assert!(request.found_in_repo);
    assert_eq!(response.map_section_id, Some(id.clone()));
    assert_eq!(engine.calls(), 0);

    processor.stop(false).await;
    let links = store.links_for_job(3);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].map_section_id, id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_cache_hits_are_refined() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let cached = tile(0, 4, 100);
    let mut flags = vec![false; 16];
    flags[0] = true;
    let partial =
        MapSectionVectors::from_parts(SizeInt::new(4, 4), vec![3; 16], vec![0; 16], flags).unwrap();
    let id = store.insert(MapSectionResponse::new(
        &cached,
        MapCalcSettings::new(100),
        partial,
        true,
    ));

    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    submit(&processor, tile(1, 4, 1000), &tx).await.unwrap();
    let delivered = receive(&mut rx, 1).await;
    let (request, response) = &delivered[0];

    assert!(!request.found_in_repo);
    assert!(request.increasing_iterations);
    assert_eq!(engine.seeded_calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.map_calc_settings.target_iterations, 1000);
    assert!(response.vectors.as_deref().unwrap().is_done(0));

    processor.stop(false).await;
    let stored = store
        .fetch_tile(&SubdivisionId::from("sub"), &BigVector::new(4, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.map_section_id, Some(id));
    assert_eq!(stored.map_calc_settings.target_iterations, 1000);
    assert_eq!(store.section_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiters_with_higher_targets_are_refined() {
    let (engine, gate) = MockEngine::gated();
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    block_generator(&processor, &engine, &tx).await;
    submit(&processor, tile(1, 6, 100), &tx).await.unwrap();
    wait_until(|| processor.get_number_of_pending_requests(1) == 1).await;
    submit(&processor, tile(2, 6, 1000), &tx).await.unwrap();
    wait_until(|| processor.get_number_of_pending_requests(2) == 1).await;

    gate.add_permits(10);
    let delivered = receive(&mut rx, 3).await;
    let (_, low) = delivered.iter().find(|(r, _)| r.job_number == 1).unwrap();
    let (_, high) = delivered.iter().find(|(r, _)| r.job_number == 2).unwrap();

    assert_eq!(low.map_calc_settings.target_iterations, 100);
    assert_eq!(high.map_calc_settings.target_iterations, 1000);
    assert!(high.request_completed);
    assert_eq!(engine.calls(), 3);
    assert_eq!(engine.seeded_calls.load(Ordering::SeqCst), 1);

    processor.stop(false).await;
    let stored = store
        .fetch_tile(&SubdivisionId::from("sub"), &BigVector::new(6, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.map_calc_settings.target_iterations, 1000);
    assert!(stored.request_completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generated_tiles_are_fetchable_after_graceful_stop() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    for x in 0..8 {
        submit(&processor, tile(1, x, 200), &tx).await.unwrap();
    }
    let _ = receive(&mut rx, 8).await;
    processor.stop(false).await;

    assert_eq!(store.section_count(), 8);
    for x in 0..8 {
        let stored = store
            .fetch_tile(&SubdivisionId::from("sub"), &BigVector::new(x, 0))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.satisfies(200).is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn use_repo_off_skips_the_store() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    store.insert(MapSectionResponse::new(
        &tile(0, 1, 5000),
        MapCalcSettings::new(5000),
        MapSectionVectors::new(SizeInt::new(4, 4)),
        true,
    ));
    let processor = RequestProcessor::new(
        store.clone(),
        vec![engine.clone()],
        PipelineConfig {
            use_repo: false,
            ..config()
        },
    )
    .unwrap();
    assert!(!processor.use_repo());
    let (tx, mut rx) = mpsc::unbounded_channel();

    submit(&processor, tile(1, 1, 100), &tx).await.unwrap();
    let delivered = receive(&mut rx, 1).await;
    assert!(!delivered[0].0.found_in_repo);
    assert_eq!(engine.calls(), 1);

    processor.stop(false).await;
    let stored = store
        .fetch_tile(&SubdivisionId::from("sub"), &BigVector::new(1, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.map_calc_settings.target_iterations, 5000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_read_failures_are_treated_as_misses() {
    let engine = Arc::new(MockEngine::default());
    let processor = pipeline(Arc::new(BrokenStore::default()), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    submit(&processor, tile(1, 0, 100), &tx).await.unwrap();
    let delivered = receive(&mut rx, 1).await;
    assert!(delivered[0].1.has_data());
    assert_eq!(engine.calls(), 1);
    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_failure_yields_an_empty_response() {
    let engine = MockEngine::failing();
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    submit(&processor, tile(1, 0, 100), &tx).await.unwrap();
    submit(&processor, tile(2, 0, 100), &tx).await.unwrap();
    let delivered = receive(&mut rx, 2).await;
    for (request, response) in &delivered {
        assert!(request.completed);
        assert!(!response.has_data());
        assert!(!response.request_cancelled);
        assert!(!response.request_completed);
    }
    assert!(engine.calls() <= 2);

    processor.stop(false).await;
    assert_eq!(store.section_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_after_stop_is_answered_once() {
    let engine = Arc::new(MockEngine::default());
    let processor = pipeline(Arc::new(InMemoryMapSectionStore::new()), engine.clone());
    processor.stop(false).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let result = processor
        .add_work(1, tile(1, 0, 100), move |_, resp| {
            assert!(resp.request_cancelled);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert!(matches!(result, Err(Error::ServiceShutdown)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_stop_answers_everything_outstanding() {
    let (engine, _gate) = MockEngine::gated();
    let processor = pipeline(Arc::new(InMemoryMapSectionStore::new()), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    block_generator(&processor, &engine, &tx).await;
    for x in 0..4 {
        submit(&processor, tile(2, x, 100), &tx).await.unwrap();
    }
    wait_until(|| processor.get_number_of_pending_requests(2) == 4).await;

    processor.stop(true).await;
    let delivered = receive(&mut rx, 5).await;
    let cancelled: Vec<_> = delivered.iter().filter(|(r, _)| r.job_number == 2).collect();
    assert_eq!(cancelled.len(), 4);
    assert!(cancelled.iter().all(|(_, resp)| resp.request_cancelled));
    assert_eq!(engine.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_callback_does_not_stop_delivery() {
    let engine = Arc::new(MockEngine::default());
    let processor = pipeline(Arc::new(InMemoryMapSectionStore::new()), engine);
    let (tx, mut rx) = mpsc::unbounded_channel();

    processor
        .add_work(1, tile(1, 0, 100), |_, _| panic!("callback failure"))
        .await
        .unwrap();
    submit(&processor, tile(1, 1, 100), &tx).await.unwrap();

    let delivered = receive(&mut rx, 1).await;
    assert_eq!(delivered[0].0.block_position, BigVector::new(1, 0));
    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_configuration_is_rejected() {
    let store: Arc<dyn MapSectionStore> = Arc::new(InMemoryMapSectionStore::new());
    let no_engines = RequestProcessor::new(store.clone(), Vec::new(), config());
    assert!(matches!(no_engines, Err(Error::InvalidConfig { .. })));

    let zero_queue = RequestProcessor::new(
        store,
        vec![Arc::new(MockEngine::default())],
        PipelineConfig {
            request_queue_capacity: 0,
            ..config()
        },
    );
    assert!(matches!(zero_queue, Err(Error::InvalidConfig { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_numbers_increase() {
    let processor = pipeline(
        Arc::new(InMemoryMapSectionStore::new()),
        Arc::new(MockEngine::default()),
    );
    let a = processor.next_job_number();
    let b = processor.next_job_number();
    assert!(b > a);
    processor.stop(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mirrors_share_their_primary_generation() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    submit(&processor, mirrored(1, 2, 100), &tx).await.unwrap();
    let delivered = receive(&mut rx, 2).await;
    assert_eq!(engine.calls(), 1);

    let (primary, primary_response) = delivered
        .iter()
        .find(|(r, _)| r.block_position == BigVector::new(2, 0))
        .unwrap();
    let (mirror, mirror_response) = delivered
        .iter()
        .find(|(r, _)| r.block_position == BigVector::new(2, -1))
        .unwrap();
    assert!(primary.mirror.is_none());
    assert!(mirror.completed);
    assert_eq!(mirror.job_number, 1);
    assert_eq!(mirror_response.block_position, BigVector::new(2, -1));
    assert!(Arc::ptr_eq(
        primary_response.vectors.as_ref().unwrap(),
        mirror_response.vectors.as_ref().unwrap()
    ));

    processor.stop(false).await;
    assert_eq!(store.section_count(), 1);
    let links = store.links_for_job(1);
    assert_eq!(links.len(), 2);
    assert!(
        links
            .iter()
            .any(|l| l.owner_id == "mirror-owner" && l.block_position == BigVector::new(2, -1))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cache_hits_answer_the_mirror_too() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    store.insert(MapSectionResponse::new(
        &tile(0, 3, 1000),
        MapCalcSettings::new(1000),
        MapSectionVectors::new(SizeInt::new(4, 4)),
        true,
    ));
    let processor = pipeline(store.clone(), engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    submit(&processor, mirrored(2, 3, 500), &tx).await.unwrap();
    let delivered = receive(&mut rx, 2).await;
    assert!(delivered.iter().all(|(r, _)| r.found_in_repo));
    assert_eq!(engine.calls(), 0);

    processor.stop(false).await;
    assert_eq!(store.links_for_job(2).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fetch_responses_answers_only_satisfied_tiles() {
    let engine = Arc::new(MockEngine::default());
    let store = Arc::new(InMemoryMapSectionStore::new());
    let id = store.insert(MapSectionResponse::new(
        &tile(0, 9, 1000),
        MapCalcSettings::new(1000),
        MapSectionVectors::new(SizeInt::new(4, 4)),
        true,
    ));
    let processor = pipeline(store.clone(), engine.clone());

    let requests = vec![mirrored(0, 9, 500), tile(0, 10, 500), tile(0, 9, 5000)];
    let fetched = processor.fetch_responses(6, requests).await;

    assert_eq!(fetched.found.len(), 2);
    let (primary, response) = &fetched.found[0];
    assert!(primary.found_in_repo);
    assert!(primary.mirror.is_none());
    assert_eq!(primary.job_number, 6);
    assert_eq!(response.map_section_id, Some(id));
    let (mirror, response) = &fetched.found[1];
    assert!(mirror.found_in_repo);
    assert_eq!(mirror.job_number, 6);
    assert_eq!(response.block_position, BigVector::new(9, -1));

    assert_eq!(fetched.missing.len(), 2);
    assert!(fetched.missing.iter().all(|r| !r.found_in_repo && r.job_number == 6));
    assert_eq!(engine.calls(), 0);
    assert_eq!(processor.number_of_requests_pending(), 0);

    // Cancelled jobs are left for the queue to answer.
    processor.cancel_job(7);
    let fetched = processor.fetch_responses(7, vec![tile(0, 9, 500)]).await;
    assert!(fetched.found.is_empty());
    assert_eq!(fetched.missing.len(), 1);

    processor.stop(false).await;
    assert_eq!(store.links_for_job(6).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pending_count_includes_requests_waiting_for_intake() {
    let (engine, gate) = MockEngine::gated();
    let processor = RequestProcessor::new(
        Arc::new(InMemoryMapSectionStore::new()),
        vec![engine.clone()],
        PipelineConfig {
            request_queue_capacity: 5,
            generator_queue_capacity: 5,
            ..config()
        },
    )
    .unwrap();
    let provider = MapSectionProvider::from_processor(processor.clone());
    let job = provider.next_job_number();
    let requests = (0..1000).map(|x| tile(job, x, 100)).collect();

    let handle = provider.submit(job, requests, |_, _| {}, |_| {});

    // The feeder is now parked on the full request queue.
    wait_until(|| engine.calls() >= 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.remaining(), 1000);
    assert_eq!(provider.pending_count(job), 1000);

    gate.add_permits(1000);
    let summary = tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
    assert_eq!(summary.completed, 1000);
    assert_eq!(provider.pending_count(job), 0);
    processor.stop(false).await;
}
