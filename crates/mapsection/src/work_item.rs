use crate::{CancelledJobs, JobItem, JobNumber};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a [`WorkItem`].
pub type WorkItemId = u64;

/// What to do once a work item has its response.
pub enum WorkAction<Req, Resp> {
    /// Runs inline on the worker.
    Sync(Box<dyn FnOnce(Req, Resp) + Send + Sync>),
    /// Awaited by the worker before it takes the next item.
    Async(Box<dyn FnOnce(Req, Resp) -> BoxFuture<'static, ()> + Send + Sync>),
    /// Runs inline, once per item; forked items share it.
    Shared(Arc<dyn Fn(Req, Resp) + Send + Sync>),
}

impl<Req, Resp> WorkAction<Req, Resp> {
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(Req, Resp) + Send + Sync + 'static,
    {
        Self::Sync(Box::new(f))
    }

    pub fn future<F>(f: F) -> Self
    where
        F: FnOnce(Req, Resp) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self::Async(Box::new(f))
    }

    pub fn shared<F>(f: F) -> Self
    where
        F: Fn(Req, Resp) + Send + Sync + 'static,
    {
        Self::Shared(Arc::new(f))
    }

    fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Shared(f) => Some(Self::Shared(f.clone())),
            Self::Sync(_) | Self::Async(_) => None,
        }
    }
}

impl<Req, Resp> core::fmt::Debug for WorkAction<Req, Resp> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("WorkAction::Sync"),
            Self::Async(_) => f.write_str("WorkAction::Async"),
            Self::Shared(_) => f.write_str("WorkAction::Shared"),
        }
    }
}

/// Couples a request with its eventual response and the action to run once
/// the response is known.
///
/// Cancellation is checked live against the owning stage's
/// [`CancelledJobs`], so cancelling a job after its items were queued still
/// takes effect.
#[derive(Debug)]
pub struct WorkItem<Req, Resp> {
    id: WorkItemId,
    job_number: JobNumber,
    pub request: Req,
    pub response: Option<Resp>,
    action: WorkAction<Req, Resp>,
    cancelled_jobs: CancelledJobs,
}

impl<Req, Resp> WorkItem<Req, Resp> {
    pub fn new(
        job_number: JobNumber,
        request: Req,
        action: WorkAction<Req, Resp>,
        cancelled_jobs: CancelledJobs,
    ) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            job_number,
            request,
            response: None,
            action,
            cancelled_jobs,
        }
    }

    pub const fn id(&self) -> WorkItemId {
        self.id
    }

    pub const fn job_number(&self) -> JobNumber {
        self.job_number
    }

    pub fn job_is_cancelled(&self) -> bool {
        self.cancelled_jobs.is_cancelled(self.job_number)
    }

    /// A new item for `request` under the same job, running the same action.
    ///
    /// Only [`WorkAction::Shared`] actions can be forked; any other action
    /// yields `None`.
    pub fn fork(&self, request: Req) -> Option<Self> {
        let action = self.action.try_clone()?;
        Some(Self::new(self.job_number, request, action, self.cancelled_jobs.clone()))
    }

    /// Consumes the item, invoking its action with `response`.
    pub async fn run_work_action(self, response: Resp) {
        match self.action {
            WorkAction::Sync(f) => f(self.request, response),
            WorkAction::Async(f) => f(self.request, response).await,
            WorkAction::Shared(f) => f(self.request, response),
        }
    }

    /// Consumes the item, invoking its action with the stored response.
    ///
    /// Returns the item unchanged if no response has been set.
    pub async fn complete(mut self) -> Result<(), Self> {
        match self.response.take() {
            Some(response) => {
                self.run_work_action(response).await;
                Ok(())
            }
            None => Err(self),
        }
    }
}

impl<Req, Resp> JobItem for WorkItem<Req, Resp> {
    fn job_number(&self) -> JobNumber {
        self.job_number
    }

    fn job_is_cancelled(&self) -> bool {
        self.cancelled_jobs.is_cancelled(self.job_number)
    }
}
