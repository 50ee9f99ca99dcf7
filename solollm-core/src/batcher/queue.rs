//! FIFO request queue with admission control.
//!
//! Admission is bounded by a semaphore sized to the queue capacity. A
//! request takes a permit when it is admitted and keeps it (inside
//! [`QueuedRequest`]) until it reaches a terminal state, so the ceiling
//! covers Queued and Running requests alike.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::config::AdmissionPolicy;
use crate::error::SchedulerError;
use crate::metrics::MetricsAggregator;

/// Error types for queue operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum QueueError {
    #[error("Queue is full (max: {max})")]
    QueueFull { max: usize },

    #[error("Queue shutdown")]
    Shutdown,
}

impl From<QueueError> for SchedulerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::QueueFull { max } => SchedulerError::CapacityExceeded { limit: max },
            QueueError::Shutdown => SchedulerError::Shutdown,
        }
    }
}

/// Tracks time spent queued and time spent processing
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    pub queued_at: Instant,
    pub started_at: Option<Instant>,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self { queued_at: Instant::now(), started_at: None }
    }

    pub fn start_processing(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn queue_wait_time(&self) -> Duration {
        self.started_at
            .map(|s| s.duration_since(self.queued_at))
            .unwrap_or_else(|| self.queued_at.elapsed())
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// A request holding an admission slot
pub struct QueuedRequest<T> {
    pub id: u64,
    pub payload: T,
    pub timer: RequestTimer,
    /// Admission slot; released when this value is dropped
    pub permit: OwnedSemaphorePermit,
}

pub struct RequestQueue<T> {
    capacity: usize,
    policy: AdmissionPolicy,
    slots: Arc<Semaphore>,
    queue: Mutex<VecDeque<QueuedRequest<T>>>,
    available: Notify,
    closed: AtomicBool,
    metrics: Arc<MetricsAggregator>,
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(capacity: usize, policy: AdmissionPolicy, metrics: Arc<MetricsAggregator>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            policy,
            slots: Arc::new(Semaphore::new(capacity)),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, QueueError> {
        match self.policy {
            AdmissionPolicy::Block => {
                self.slots.clone().acquire_owned().await.map_err(|_| QueueError::Shutdown)
            }
            AdmissionPolicy::Reject => match self.slots.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) => {
                    self.metrics.record_rejected();
                    Err(QueueError::QueueFull { max: self.capacity })
                }
                Err(TryAcquireError::Closed) => Err(QueueError::Shutdown),
            },
        }
    }

    /// Admit `payload` at the back of the queue.
    ///
    /// Under [`AdmissionPolicy::Block`] this waits for a free slot; admission
    /// waiters are served in arrival order.
    pub async fn enqueue(&self, id: u64, payload: T) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Shutdown);
        }
        let permit = self.admit().await?;

        {
            let mut queue = self.queue.lock();
            // close() may have run while we waited for the slot
            if self.is_closed() {
                return Err(QueueError::Shutdown);
            }
            queue.push_back(QueuedRequest { id, payload, timer: RequestTimer::new(), permit });
            self.metrics.record_queued();
            tracing::debug!(request_id = id, queue_depth = queue.len(), "Request enqueued");
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the oldest request, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn dequeue(&self) -> Option<QueuedRequest<T>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(mut queued) = self.queue.lock().pop_front() {
                queued.timer.start_processing();
                let wait = queued.timer.queue_wait_time();
                self.metrics.record_dequeued(wait);
                tracing::debug!(request_id = queued.id, wait_ms = wait.as_millis() as u64, "Request dequeued");
                return Some(queued);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Remove a still-queued request by id
    pub fn remove(&self, id: u64) -> Option<QueuedRequest<T>> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|q| q.id == id)?;
        let removed = queue.remove(pos);
        if removed.is_some() {
            self.metrics.record_cancelled_in_queue();
            tracing::debug!(request_id = id, queue_depth = queue.len(), "Request removed from queue");
        }
        removed
    }

    /// Stop admission. Blocked submitters fail with `Shutdown`; workers
    /// drain what is left and then see `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.slots.close();
        self.available.notify_waiters();
    }

    /// Remove every queued request
    pub fn drain(&self) -> Vec<QueuedRequest<T>> {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for _ in &drained {
            self.metrics.record_cancelled_in_queue();
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Free admission slots (capacity minus Queued and Running)
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize, policy: AdmissionPolicy) -> (RequestQueue<String>, Arc<MetricsAggregator>) {
        let metrics = Arc::new(MetricsAggregator::new());
        (RequestQueue::new(capacity, policy, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let (queue, metrics) = queue(4, AdmissionPolicy::Block);
        for i in 0..3 {
            queue.enqueue(i, format!("req{i}")).await.unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(metrics.snapshot().queue_depth, 3);

        for i in 0..3 {
            let queued = queue.dequeue().await.unwrap();
            assert_eq!(queued.id, i);
            assert_eq!(queued.payload, format!("req{i}"));
        }
        assert!(queue.is_empty());
        assert_eq!(metrics.snapshot().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_permit_outlives_dequeue() {
        let (queue, _) = queue(2, AdmissionPolicy::Reject);
        queue.enqueue(1, "a".into()).await.unwrap();
        queue.enqueue(2, "b".into()).await.unwrap();

        let running = queue.dequeue().await.unwrap();
        assert_eq!(queue.available_slots(), 0);
        assert_eq!(queue.enqueue(3, "c".into()).await, Err(QueueError::QueueFull { max: 2 }));

        drop(running);
        assert_eq!(queue.available_slots(), 1);
        queue.enqueue(3, "c".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_records_metric() {
        let (queue, metrics) = queue(1, AdmissionPolicy::Reject);
        queue.enqueue(1, "a".into()).await.unwrap();
        let err: SchedulerError = queue.enqueue(2, "b".into()).await.unwrap_err().into();

        assert_eq!(err, SchedulerError::CapacityExceeded { limit: 1 });
        assert_eq!(metrics.snapshot().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_block_waits_for_slot() {
        let (queue, _) = queue(1, AdmissionPolicy::Block);
        let queue = Arc::new(queue);
        queue.enqueue(1, "a".into()).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(2, "b".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(queue.dequeue().await);
        blocked.await.unwrap().unwrap();
        assert_eq!(queue.dequeue().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_remove_frees_slot() {
        let (queue, metrics) = queue(2, AdmissionPolicy::Reject);
        queue.enqueue(1, "a".into()).await.unwrap();
        queue.enqueue(2, "b".into()).await.unwrap();

        let removed = queue.remove(1).unwrap();
        assert_eq!(removed.payload, "a");
        drop(removed);
        assert!(queue.remove(1).is_none());

        assert_eq!(queue.available_slots(), 1);
        assert_eq!(metrics.snapshot().cancelled_while_queued, 1);
        assert_eq!(queue.dequeue().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_close_wakes_idle_dequeue() {
        let (queue, _) = queue(2, AdmissionPolicy::Block);
        let queue = Arc::new(queue);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.map(|q| q.id) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(queue.enqueue(9, "late".into()).await, Err(QueueError::Shutdown));
    }

    #[tokio::test]
    async fn test_close_fails_blocked_submitter() {
        let (queue, _) = queue(1, AdmissionPolicy::Block);
        let queue = Arc::new(queue);
        queue.enqueue(1, "a".into()).await.unwrap();

        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(2, "b".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(blocked.await.unwrap(), Err(QueueError::Shutdown));
        assert_eq!(queue.drain().len(), 1);
    }
}
