use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation key for every request that belongs to one screen of tiles.
pub type JobNumber = u64;

/// The set of job numbers a stage has been told to abandon.
///
/// Cloning is cheap and every clone observes the same set, so a work item can
/// hold a handle and check its job *live* rather than snapshotting a flag at
/// enqueue time. Reads never block writers for longer than a hash lookup.
#[derive(Clone, Debug, Default)]
pub struct CancelledJobs {
    inner: Arc<RwLock<HashSet<JobNumber>>>,
}

impl CancelledJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `job` as cancelled. Returns `false` if it already was.
    pub fn cancel(&self, job: JobNumber) -> bool {
        self.inner.write().insert(job)
    }

    pub fn is_cancelled(&self, job: JobNumber) -> bool {
        self.inner.read().contains(&job)
    }

    /// Forgets `job` so the set does not grow for the lifetime of the process.
    pub fn mark_complete(&self, job: JobNumber) -> bool {
        self.inner.write().remove(&job)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Hands out monotonically increasing job numbers, starting at 1.
#[derive(Debug)]
pub struct JobNumberSequence {
    next: AtomicU64,
}

impl JobNumberSequence {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> JobNumber {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for JobNumberSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests accepted for a job that have not reached a queue yet.
///
/// Callers that feed a large job through a bounded queue reserve the whole
/// job up front, so the job's backlog is visible while the feeder waits.
#[derive(Clone, Debug, Default)]
pub struct JobBacklog {
    inner: Arc<Mutex<HashMap<JobNumber, usize>>>,
}

impl JobBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts `count` requests of `job` as waiting for intake.
    pub fn reserve(&self, job: JobNumber, count: usize) -> BacklogReservation {
        if count > 0 {
            *self.inner.lock().entry(job).or_default() += count;
        }
        BacklogReservation {
            backlog: self.clone(),
            job,
            outstanding: count,
        }
    }

    pub fn count_for_job(&self, job: JobNumber) -> usize {
        self.inner.lock().get(&job).copied().unwrap_or_default()
    }

    /// Waiting requests across all jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn release(&self, job: JobNumber, count: usize) {
        let mut inner = self.inner.lock();
        if let Some(waiting) = inner.get_mut(&job) {
            *waiting = waiting.saturating_sub(count);
            if *waiting == 0 {
                inner.remove(&job);
            }
        }
    }
}

/// A job's share of a [`JobBacklog`]. Whatever is still outstanding is
/// released on drop.
#[derive(Debug)]
pub struct BacklogReservation {
    backlog: JobBacklog,
    job: JobNumber,
    outstanding: usize,
}

impl BacklogReservation {
    pub const fn job_number(&self) -> JobNumber {
        self.job
    }

    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Releases up to `count` requests that have left the backlog.
    pub fn release(&mut self, count: usize) {
        let count = count.min(self.outstanding);
        if count > 0 {
            self.outstanding -= count;
            self.backlog.release(self.job, count);
        }
    }
}

impl Drop for BacklogReservation {
    fn drop(&mut self) {
        self.release(self.outstanding);
    }
}
