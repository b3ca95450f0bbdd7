use super::MapSectionWorkRequest;
use super::pool::WorkerSet;
use crate::{MapSectionResponse, QueueError, Rejected};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The terminal stage: hands each finished request back to its caller.
///
/// Every item's callback runs exactly once, on this stage's worker. A
/// panicking callback is caught and logged so later callers are still served.
pub struct ResponseProcessor {
    tx: Mutex<Option<mpsc::Sender<MapSectionWorkRequest>>>,
    workers: WorkerSet,
}

impl ResponseProcessor {
    /// Spawns the delivery worker. Must be called from within a Tokio runtime.
    pub fn new(capacity: usize, token: CancellationToken, stop_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let workers = WorkerSet::new("response", token, stop_timeout);
        workers.spawn(response_loop(rx, workers.token().clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            workers,
        }
    }

    /// Queues `item` for delivery, waiting while the channel is full.
    ///
    /// # Errors
    ///
    /// Hands the item back once the processor is stopping, so the caller can
    /// still answer it.
    pub async fn add_work(
        &self,
        item: MapSectionWorkRequest,
    ) -> Result<(), Rejected<MapSectionWorkRequest>> {
        let Some(tx) = self.tx.lock().clone() else {
            return Err(Rejected {
                item,
                error: QueueError::AddingCompleted,
            });
        };
        let permit = tokio::select! {
            biased;
            () = self.workers.token().cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(item);
                Ok(())
            }
            None => Err(Rejected {
                item,
                error: QueueError::Cancelled,
            }),
        }
    }

    /// Stops intake and waits for the worker. A graceful stop delivers
    /// everything already queued.
    pub async fn stop(&self, immediately: bool) {
        self.tx.lock().take();
        self.workers.join(immediately).await;
    }
}

async fn response_loop(
    mut rx: mpsc::Receiver<MapSectionWorkRequest>,
    token: CancellationToken,
) -> crate::Result<()> {
    tracing::trace!("Response worker started");
    loop {
        let item = tokio::select! {
            biased;
            () = token.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        deliver(item).await;
    }
    tracing::trace!("Response worker stopped");
    Ok(())
}

/// Finalises `item` and runs its callback.
///
/// Flags the response as cancelled if the job is cancelled, marks the request
/// completed and stamps its end time. An item without a response is answered
/// with an empty one. A mirror riding on the request is answered right after
/// it, with the same outcome.
pub(crate) async fn deliver(mut item: MapSectionWorkRequest) {
    let mut response = item
        .response
        .take()
        .unwrap_or_else(|| MapSectionResponse::empty(&item.request));
    if item.job_is_cancelled() {
        response.request_cancelled = true;
    }
    item.request.completed = true;
    item.request.processing_end_time = Some(Instant::now());

    let mirror = item.request.take_mirror().and_then(|mirror| {
        let mirror_response = response.for_mirror(&mirror);
        let forked = item.fork(mirror).map(|fork| (fork, mirror_response));
        if forked.is_none() {
            tracing::warn!(job = item.job_number(), "Dropping mirror: callback runs only once");
        }
        forked
    });

    run_callback(item, response).await;
    if let Some((mirror, response)) = mirror {
        run_callback(mirror, response).await;
    }
}

async fn run_callback(item: MapSectionWorkRequest, response: MapSectionResponse) {
    let job = item.job_number();
    let request_number = item.request.request_number;
    if let Err(panic) = AssertUnwindSafe(item.run_work_action(response))
        .catch_unwind()
        .await
    {
        let message = panic_message(&*panic);
        tracing::error!(job, request_number, "Response callback panicked: {message}");
    }
}

pub(crate) fn panic_message(panic: &(dyn core::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
