use super::pool::WorkerSet;
use crate::{
    Error, JobMapSectionLink, MapSectionResponse, MapSectionStore, OwnerRef, RecordId, Result,
    StoreError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A write for the map-section store.
#[derive(Debug, Clone)]
pub enum PersistRequest {
    /// Insert or update a generated section, then link every owner to it.
    MapSection {
        response: MapSectionResponse,
        owners: Vec<OwnerRef>,
    },
    /// Link an owner to a section that was already on file.
    JobLink { link: JobMapSectionLink },
}

/// A single background writer in front of the store.
///
/// `add_work` applies backpressure once the channel is full. Store failures
/// are logged and dropped: a missing cache entry only costs a regeneration.
pub struct PersistProcessor {
    tx: Mutex<Option<mpsc::Sender<PersistRequest>>>,
    workers: WorkerSet,
}

impl PersistProcessor {
    /// Spawns the writer. Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn MapSectionStore>,
        capacity: usize,
        token: CancellationToken,
        stop_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let workers = WorkerSet::new("persist", token, stop_timeout);
        workers.spawn(persist_loop(rx, store, workers.token().clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            workers,
        }
    }

    /// Queues a write, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] once the processor is stopping.
    pub async fn add_work(&self, request: PersistRequest) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(Error::ServiceShutdown);
        };
        tokio::select! {
            biased;
            () = self.workers.token().cancelled() => Err(Error::ServiceShutdown),
            sent = tx.send(request) => sent.map_err(|_| Error::ChannelError {
                context: "persist channel closed".to_string(),
            }),
        }
    }

    /// Stops intake and waits for the writer. A graceful stop writes
    /// everything already queued.
    pub async fn stop(&self, immediately: bool) {
        self.tx.lock().take();
        self.workers.join(immediately).await;
    }
}

async fn persist_loop(
    mut rx: mpsc::Receiver<PersistRequest>,
    store: Arc<dyn MapSectionStore>,
    token: CancellationToken,
) -> Result<()> {
    tracing::trace!("Persist worker started");
    loop {
        let request = tokio::select! {
            biased;
            () = token.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        persist(store.as_ref(), request).await;
    }
    tracing::trace!("Persist worker stopped");
    Ok(())
}

async fn persist(store: &dyn MapSectionStore, request: PersistRequest) {
    match request {
        PersistRequest::MapSection { response, owners } => {
            let key = response.tile_key();
            let Some(id) = save_or_update(store, &response).await else {
                return;
            };
            tracing::debug!(tile = %key, record = %id, "Persisted map section");
            for owner in owners {
                let link = owner.into_link(id.clone());
                if let Err(e) = store.save_job_link(&link).await {
                    tracing::error!(
                        tile = %key,
                        job = link.job_number,
                        "Failed to save job link: {e}"
                    );
                }
            }
        }
        PersistRequest::JobLink { link } => {
            if let Err(e) = store.save_job_link(&link).await {
                tracing::error!(job = link.job_number, "Failed to save job link: {e}");
            }
        }
    }
}

/// Updates the record the response came from, or inserts a new one.
async fn save_or_update(
    store: &dyn MapSectionStore,
    response: &MapSectionResponse,
) -> Option<RecordId> {
    if let Some(id) = &response.map_section_id {
        match store.update_tile(id, response).await {
            Ok(()) => return Some(id.clone()),
            Err(StoreError::NotFound { .. }) => {
                tracing::warn!(record = %id, "Record vanished, inserting a new one");
            }
            Err(e) => {
                tracing::error!(record = %id, "Failed to update map section: {e}");
                return None;
            }
        }
    }
    match store.save_tile(response).await {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::error!(tile = %response.tile_key(), "Failed to save map section: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BigVector, InMemoryMapSectionStore, MapCalcSettings, MapSectionRequest, MapSectionVectors,
        OwnerType, RPoint, RSize, SizeInt, SubdivisionId,
    };

    fn response(x: i64) -> (MapSectionRequest, MapSectionResponse) {
        let request = MapSectionRequest::new(
            7,
            0,
            SubdivisionId::from("sub"),
            BigVector::new(x, 0),
            RPoint::default(),
            RSize::default(),
            MapCalcSettings::new(100),
        )
        .with_block_size(SizeInt::new(2, 2))
        .with_owner("owner", OwnerType::Poster);
        let response = MapSectionResponse::new(
            &request,
            MapCalcSettings::new(100),
            MapSectionVectors::new(SizeInt::new(2, 2)),
            true,
        );
        (request, response)
    }

    #[tokio::test]
    async fn graceful_stop_writes_everything_queued() {
        let store = Arc::new(InMemoryMapSectionStore::new());
        let persist = PersistProcessor::new(
            store.clone(),
            4,
            CancellationToken::new(),
            Duration::from_secs(5),
        );

        for x in 0..10 {
            let (request, response) = response(x);
            let owners = OwnerRef::for_request(&request).into_iter().collect();
            persist
                .add_work(PersistRequest::MapSection { response, owners })
                .await
                .unwrap();
        }
        persist.stop(false).await;

        assert_eq!(store.section_count(), 10);
        assert_eq!(store.links_for_job(7).len(), 10);
        assert!(matches!(
            persist
                .add_work(PersistRequest::MapSection {
                    response: response(99).1,
                    owners: Vec::new()
                })
                .await,
            Err(Error::ServiceShutdown)
        ));
    }

    #[tokio::test]
    async fn unknown_record_ids_fall_back_to_insert() {
        let store = Arc::new(InMemoryMapSectionStore::new());
        let (_, mut response) = response(1);
        response.map_section_id = Some(RecordId::new("gone"));

        let id = save_or_update(store.as_ref(), &response).await.unwrap();
        assert_ne!(id, RecordId::new("gone"));
        assert_eq!(store.section_count(), 1);
    }
}
