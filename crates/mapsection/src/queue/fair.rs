use crate::{JobNumber, QueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// An item that can be scheduled by a [`FairJobQueue`].
pub trait JobItem {
    /// The job this item belongs to.
    fn job_number(&self) -> JobNumber;

    /// Whether the item's job has been cancelled. Must be a live check.
    fn job_is_cancelled(&self) -> bool;
}

/// An item the queue refused, handed back to the caller together with the
/// reason.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub error: QueueError,
}

impl<T> Rejected<T> {
    pub fn into_inner(self) -> T {
        self.item
    }
}

struct State<T> {
    jobs: Vec<JobNumber>,
    lists: Vec<VecDeque<T>>,
    cursor: usize,
    count: usize,
    // (job, index into `jobs`) of the most recent `add`
    last_added: Option<(JobNumber, usize)>,
}

impl<T: JobItem> State<T> {
    fn new() -> Self {
        Self {
            jobs: Vec::new(),
            lists: Vec::new(),
            cursor: 0,
            count: 0,
            last_added: None,
        }
    }

    fn index_of(&mut self, job: JobNumber) -> usize {
        if let Some((cached, idx)) = self.last_added {
            if cached == job {
                return idx;
            }
        }
        let idx = match self.jobs.iter().position(|j| *j == job) {
            Some(idx) => idx,
            None => {
                self.jobs.push(job);
                self.lists.push(VecDeque::new());
                self.jobs.len() - 1
            }
        };
        self.last_added = Some((job, idx));
        idx
    }

    fn push(&mut self, item: T) {
        let idx = self.index_of(item.job_number());
        self.lists[idx].push_back(item);
        self.count += 1;
    }

    fn pop(&mut self) -> Result<Option<T>, QueueError> {
        if self.jobs.is_empty() {
            return Ok(None);
        }
        if self.cursor >= self.jobs.len() {
            self.cursor = 0;
        }

        let cursor = self.cursor;
        let Some(item) = self.lists[cursor].pop_front() else {
            return Err(QueueError::InvalidState {
                context: format!("job {} is scheduled with no items", self.jobs[cursor]),
            });
        };
        self.count -= 1;

        if self.lists[cursor].is_empty() {
            self.jobs.remove(cursor);
            self.lists.remove(cursor);
            self.last_added = None;
            if self.cursor >= self.jobs.len() {
                self.cursor = 0;
            }
        } else if !item.job_is_cancelled() {
            // Cancelled jobs keep the cursor so their leftovers drain together.
            self.cursor = (cursor + 1) % self.jobs.len();
        }

        Ok(Some(item))
    }
}

/// A bounded queue that round-robins across jobs and is FIFO within a job.
///
/// Each active job has its own sub-queue; `take` serves the job under a
/// cursor and then moves the cursor to the next job, so a job with one pending
/// item is served as often as a job with ten thousand. A job disappears from
/// the rotation as soon as its sub-queue empties.
///
/// Capacity is enforced with a pair of semaphores: `add` waits for a free slot
/// and `take` waits for a queued item. Both waits race a
/// [`CancellationToken`]. After [`complete_adding`](Self::complete_adding),
/// `add` is refused and `take` drains what is left before reporting
/// [`QueueError::Completed`].
pub struct FairJobQueue<T> {
    state: Mutex<State<T>>,
    slots: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl<T: JobItem> FairJobQueue<T> {
    /// Creates a queue that holds at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds [`Semaphore::MAX_PERMITS`].
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            state: Mutex::new(State::new()),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Adds `item`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Hands the item back if `token` fires while waiting
    /// ([`QueueError::Cancelled`]) or adding has been completed
    /// ([`QueueError::AddingCompleted`]).
    pub async fn add(&self, item: T, token: &CancellationToken) -> Result<(), Rejected<T>> {
        let acquired = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(Rejected { item, error: QueueError::Cancelled });
            }
            permit = self.slots.acquire() => permit,
        };
        match acquired {
            Ok(permit) => permit.forget(),
            Err(_) => {
                return Err(Rejected {
                    item,
                    error: QueueError::AddingCompleted,
                });
            }
        }

        self.state.lock().push(item);
        self.items.add_permits(1);
        Ok(())
    }

    /// Removes the next item in round-robin order, waiting while the queue is
    /// empty.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Cancelled`] if `token` fires while waiting.
    /// - [`QueueError::Completed`] once adding is complete and the queue is
    ///   drained.
    /// - [`QueueError::InvalidState`] if the bookkeeping is corrupt.
    pub async fn take(&self, token: &CancellationToken) -> Result<T, QueueError> {
        let acquired = tokio::select! {
            biased;
            () = token.cancelled() => return Err(QueueError::Cancelled),
            permit = self.items.acquire() => permit,
        };

        let popped = {
            let mut state = self.state.lock();
            match acquired {
                Ok(permit) => {
                    permit.forget();
                    state.pop()?
                }
                // Closed: drain whatever is left without waiting.
                Err(_) => state.pop()?,
            }
        };

        match popped {
            Some(item) => {
                self.slots.add_permits(1);
                Ok(item)
            }
            None if self.is_adding_completed() => Err(QueueError::Completed),
            None => Err(QueueError::InvalidState {
                context: "item permit issued for an empty queue".to_string(),
            }),
        }
    }

    /// Stops intake. Pending and future `take`s drain the remaining items.
    pub fn complete_adding(&self) {
        self.slots.close();
        self.items.close();
    }

    /// Removes every queued item without waiting, in round-robin order.
    ///
    /// Intended for after a hard stop, when no consumer will take them.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.count);
        while let Ok(Some(item)) = state.pop() {
            drained.push(item);
        }
        drop(state);
        if let Ok(n) = u32::try_from(drained.len()) {
            if let Ok(permits) = self.items.try_acquire_many(n) {
                permits.forget();
            }
        }
        self.slots.add_permits(drained.len());
        drained
    }

    pub fn is_adding_completed(&self) -> bool {
        self.items.is_closed()
    }

    pub fn len(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items queued for `job`.
    pub fn len_for_job(&self, job: JobNumber) -> usize {
        let state = self.state.lock();
        state
            .jobs
            .iter()
            .position(|j| *j == job)
            .map_or(0, |idx| state.lists[idx].len())
    }

    /// Jobs that currently have queued items, in rotation order.
    pub fn active_jobs(&self) -> Vec<JobNumber> {
        self.state.lock().jobs.clone()
    }
}

impl<T> core::fmt::Debug for FairJobQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FairJobQueue")
            .field("capacity", &self.capacity)
            .field("count", &state.count)
            .field("jobs", &state.jobs)
            .field("cursor", &state.cursor)
            .finish()
    }
}
