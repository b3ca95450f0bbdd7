use super::*;
use crate::{CancelledJobs, JobNumber, QueueError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Item {
    job: JobNumber,
    seq: usize,
    cancelled: CancelledJobs,
}

impl JobItem for Item {
    fn job_number(&self) -> JobNumber {
        self.job
    }

    fn job_is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled(self.job)
    }
}

fn item(job: JobNumber, seq: usize, cancelled: &CancelledJobs) -> Item {
    Item {
        job,
        seq,
        cancelled: cancelled.clone(),
    }
}

async fn fill(queue: &FairJobQueue<Item>, job: JobNumber, n: usize, cancelled: &CancelledJobs) {
    let token = CancellationToken::new();
    for seq in 0..n {
        queue.add(item(job, seq, cancelled), &token).await.unwrap();
    }
}

async fn take_jobs(queue: &FairJobQueue<Item>, n: usize) -> Vec<(JobNumber, usize)> {
    let token = CancellationToken::new();
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let item = queue.take(&token).await.unwrap();
        out.push((item.job, item.seq));
    }
    out
}

#[tokio::test]
async fn round_robins_across_jobs_and_is_fifo_within_a_job() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(64);
    fill(&queue, 1, 3, &cancelled).await;
    fill(&queue, 2, 2, &cancelled).await;
    fill(&queue, 3, 1, &cancelled).await;

    let order = take_jobs(&queue, 6).await;
    assert_eq!(
        order,
        vec![(1, 0), (2, 0), (3, 0), (1, 1), (2, 1), (1, 2)]
    );
    assert!(queue.is_empty());
    assert!(queue.active_jobs().is_empty());
}

#[tokio::test]
async fn small_job_is_not_starved_by_a_large_one() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(20_000);
    fill(&queue, 1, 10_000, &cancelled).await;
    let _ = take_jobs(&queue, 17).await;

    fill(&queue, 2, 1, &cancelled).await;
    let active = queue.active_jobs().len();
    let next = take_jobs(&queue, active).await;
    assert!(next.iter().any(|(job, _)| *job == 2));
}

#[tokio::test]
async fn empty_jobs_leave_the_rotation() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(16);
    fill(&queue, 1, 1, &cancelled).await;
    fill(&queue, 2, 3, &cancelled).await;

    assert_eq!(queue.active_jobs(), vec![1, 2]);
    assert_eq!(queue.len_for_job(2), 3);
    let _ = take_jobs(&queue, 2).await;

    assert_eq!(queue.active_jobs(), vec![2]);
    assert_eq!(queue.len_for_job(1), 0);
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn cancelled_job_drains_consecutively() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(16);
    fill(&queue, 1, 3, &cancelled).await;
    fill(&queue, 2, 3, &cancelled).await;
    cancelled.cancel(1);

    let order = take_jobs(&queue, 6).await;
    assert_eq!(
        order,
        vec![(1, 0), (1, 1), (1, 2), (2, 0), (2, 1), (2, 2)]
    );
}

#[tokio::test]
async fn add_waits_for_capacity() {
    let cancelled = CancelledJobs::new();
    let queue = Arc::new(FairJobQueue::new(2));
    fill(&queue, 1, 2, &cancelled).await;

    let producer = {
        let queue = queue.clone();
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            queue
                .add(item(1, 2, &cancelled), &CancellationToken::new())
                .await
                .unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert_eq!(queue.len(), 2);

    let _ = take_jobs(&queue, 1).await;
    producer.await.unwrap();
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn waits_are_abortable() {
    let cancelled = CancelledJobs::new();
    let queue = Arc::new(FairJobQueue::<Item>::new(1));
    let token = CancellationToken::new();

    let taker = {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move { queue.take(&token).await })
    };
    token.cancel();
    assert_eq!(taker.await.unwrap().unwrap_err(), QueueError::Cancelled);

    fill(&queue, 1, 1, &cancelled).await;
    let rejected = queue.add(item(1, 1, &cancelled), &token).await.unwrap_err();
    assert_eq!(rejected.error, QueueError::Cancelled);
    assert_eq!(rejected.into_inner().seq, 1);
}

#[tokio::test]
async fn complete_adding_drains_then_completes() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(8);
    fill(&queue, 1, 2, &cancelled).await;
    queue.complete_adding();

    let token = CancellationToken::new();
    let rejected = queue.add(item(1, 9, &cancelled), &token).await.unwrap_err();
    assert_eq!(rejected.error, QueueError::AddingCompleted);

    assert_eq!(queue.take(&token).await.unwrap().seq, 0);
    assert_eq!(queue.take(&token).await.unwrap().seq, 1);
    assert_eq!(queue.take(&token).await.unwrap_err(), QueueError::Completed);
}

#[tokio::test]
async fn complete_adding_wakes_blocked_takers() {
    let queue = Arc::new(FairJobQueue::<Item>::new(4));
    let taker = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.take(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.complete_adding();
    assert_eq!(taker.await.unwrap().unwrap_err(), QueueError::Completed);
}

#[tokio::test]
async fn drain_empties_the_queue_in_rotation_order() {
    let cancelled = CancelledJobs::new();
    let queue = FairJobQueue::new(8);
    fill(&queue, 1, 2, &cancelled).await;
    fill(&queue, 2, 1, &cancelled).await;

    let drained: Vec<_> = queue.drain().into_iter().map(|i| (i.job, i.seq)).collect();
    assert_eq!(drained, vec![(1, 0), (2, 0), (1, 1)]);
    assert!(queue.is_empty());

    // Capacity is fully available again and nothing stale is left to take.
    fill(&queue, 3, 8, &cancelled).await;
    assert_eq!(take_jobs(&queue, 8).await.len(), 8);
    assert!(queue.is_empty());
}
