//! Task queue and envelope
//!
//! A FIFO of envelopes with join-style completion tracking: every enqueued
//! element - poison included - must be acknowledged via `mark_done` exactly
//! once, and `wait_completion` returns when the unfinished count reaches
//! zero. Workers are stopped by enqueueing a poison (`None`) per worker.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

/// One queue element: a slice of the shared task batch plus retry
/// bookkeeping. Requeued on failure until the retry budget is spent.
#[derive(Debug, Clone)]
pub struct TaskEnvelope<T> {
    pub index: usize,
    pub batch: Arc<Vec<T>>,
    pub retry_count: u32,
}

impl<T> TaskEnvelope<T> {
    pub fn new(index: usize, batch: Arc<Vec<T>>) -> Self {
        Self {
            index,
            batch,
            retry_count: 0,
        }
    }
}

/// `None` is the poison that tells a worker to exit.
pub type QueueItem<T> = Option<TaskEnvelope<T>>;

struct QueueState<T> {
    items: VecDeque<QueueItem<T>>,
    unfinished: usize,
}

pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    all_done: Notify,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            available: Notify::new(),
            all_done: Notify::new(),
        }
    }

    pub fn enqueue(&self, envelope: TaskEnvelope<T>) {
        self.push(Some(envelope));
    }

    /// Enqueue one poison; the receiving worker acknowledges it and exits.
    pub fn enqueue_poison(&self) {
        self.push(None);
    }

    fn push(&self, item: QueueItem<T>) {
        {
            let mut state = self.state.lock().unwrap();
            state.items.push_back(item);
            state.unfinished += 1;
        }
        self.available.notify_one();
    }

    /// Next item within `timeout`, or `None` on an empty queue.
    /// `Some(None)` is the poison.
    pub async fn dequeue(&self, timeout: Duration) -> Option<QueueItem<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.state.lock().unwrap().items.pop_front() {
                return Some(item);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.state.lock().unwrap().items.pop_front();
            }
        }
    }

    /// Acknowledge one dequeued item. Must be called exactly once per item.
    pub fn mark_done(&self) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            if state.unfinished == 0 {
                warn!("mark_done called with no unfinished items");
                return;
            }
            state.unfinished -= 1;
            state.unfinished == 0
        };
        if finished {
            self.all_done.notify_waiters();
        }
    }

    /// Block until every enqueued item has been acknowledged.
    pub async fn wait_completion(&self) {
        loop {
            let notified = self.all_done.notified();
            if self.state.lock().unwrap().unfinished == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Items currently queued (not yet dequeued).
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items enqueued but not yet acknowledged (queued + in flight).
    pub fn unfinished(&self) -> usize {
        self.state.lock().unwrap().unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        let batch = Arc::new(vec![10u32, 20, 30]);
        for i in 0..3 {
            queue.enqueue(TaskEnvelope::new(i, Arc::clone(&batch)));
        }
        for expected in 0..3 {
            let envelope = queue
                .dequeue(Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(envelope.index, expected);
            queue.mark_done();
        }
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn poison_is_delivered_in_order() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        queue.enqueue(TaskEnvelope::new(0, Arc::new(vec![1])));
        queue.enqueue_poison();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(first.is_some());
        queue.mark_done();

        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(second.is_none());
        queue.mark_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn wait_completion_blocks_until_all_done() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
        queue.enqueue(TaskEnvelope::new(0, Arc::new(vec![1])));
        queue.enqueue(TaskEnvelope::new(1, Arc::new(vec![1])));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_completion().await })
        };

        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.mark_done();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.mark_done();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_completion_returns_immediately_when_drained() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        queue.wait_completion().await;
    }

    #[tokio::test]
    async fn requeued_envelope_joins_the_tail() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        let batch = Arc::new(vec![1u32, 2]);
        queue.enqueue(TaskEnvelope::new(0, Arc::clone(&batch)));
        queue.enqueue(TaskEnvelope::new(1, Arc::clone(&batch)));

        let mut first = queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        first.retry_count += 1;
        queue.enqueue(first);
        queue.mark_done();

        let next = queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.index, 1);
        queue.mark_done();

        let retried = queue
            .dequeue(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.index, 0);
        assert_eq!(retried.retry_count, 1);
        queue.mark_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn excess_mark_done_is_ignored() {
        let queue: TaskQueue<u32> = TaskQueue::new();
        queue.mark_done();
        assert_eq!(queue.unfinished(), 0);
    }

    #[tokio::test]
    async fn concurrent_producers_and_consumers_balance() {
        let queue: Arc<TaskQueue<usize>> = Arc::new(TaskQueue::new());
        let batch = Arc::new((0..100).collect::<Vec<_>>());

        let producer = {
            let queue = Arc::clone(&queue);
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.enqueue(TaskEnvelope::new(i, Arc::clone(&batch)));
                }
            })
        };

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut seen = 0;
                    while let Some(item) = queue.dequeue(Duration::from_millis(200)).await {
                        assert!(item.is_some());
                        queue.mark_done();
                        seen += 1;
                    }
                    seen
                })
            })
            .collect();

        producer.await.unwrap();
        queue.wait_completion().await;

        let total: usize = futures::future::join_all(consumers)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();
        assert_eq!(total, 100);
    }
}
