use crate::Result;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// The long-lived tasks that make up one pipeline stage.
///
/// Workers watch the stage's [`CancellationToken`]; a hard stop cancels it
/// up front, a graceful stop only cancels it if the workers have not exited
/// within the stop timeout.
pub(crate) struct WorkerSet {
    stage: &'static str,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
    stop_timeout: Duration,
}

impl WorkerSet {
    pub(crate) fn new(
        stage: &'static str,
        token: CancellationToken,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            stage,
            token,
            handles: Mutex::new(Vec::new()),
            stop_timeout,
        }
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn spawn<F>(&self, worker: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.handles.lock().push(tokio::spawn(worker));
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Waits for every worker to exit. Returns `false` if the stop timed out
    /// and the remaining workers had to be cancelled.
    pub(crate) async fn join(&self, immediately: bool) -> bool {
        if immediately {
            self.token.cancel();
        }

        let handles = core::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return true;
        }
        tracing::debug!(
            stage = self.stage,
            workers = handles.len(),
            immediately,
            "Waiting for workers to exit"
        );

        match timeout(self.stop_timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                for (worker_id, result) in results.into_iter().enumerate() {
                    match result {
                        Ok(Ok(())) => {
                            tracing::trace!(stage = self.stage, worker_id, "Worker exited");
                        }
                        Ok(Err(e)) => {
                            tracing::error!(stage = self.stage, worker_id, "Worker failed: {e}");
                        }
                        Err(e) => {
                            tracing::error!(stage = self.stage, worker_id, "Worker panicked: {e}");
                        }
                    }
                }
                tracing::info!(stage = self.stage, "Stage stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    stage = self.stage,
                    timeout = ?self.stop_timeout,
                    "Stop timed out, cancelling remaining workers"
                );
                self.token.cancel();
                false
            }
        }
    }
}
