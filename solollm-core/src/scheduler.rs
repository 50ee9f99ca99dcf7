//! Scheduler facade
//!
//! Many callers submit prompts; one model serves them one at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐  submit   ┌──────────────┐  pop+stage  ┌───────────┐
//! │  callers  │ ────────▶ │ RequestQueue │ ──────────▶ │  workers  │
//! └─────▲─────┘           └──────────────┘             └─────┬─────┘
//!       │ fragments / result / status                        │ gate
//!       └──────────────────────────────────────────── ┌──────▼──────┐
//!                                                     │   engine    │
//!                                                     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use solollm_core::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(engine, SchedulerConfig::default());
//! let mut handle = scheduler.submit("Hello").await?;
//! while let Some(fragment) = handle.next_fragment().await {
//!     print!("{fragment}");
//! }
//! let completion = handle.wait().await?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batcher::worker::{run_worker, WorkerContext};
use crate::batcher::{Job, RequestQueue, SchedulerConfig};
use crate::conversation::Message;
use crate::engine::{InferenceBackend, InferenceEngine};
use crate::error::SchedulerError;
use crate::executor::SingleFlightExecutor;
use crate::metrics::{start_sampling, MetricsAggregator, PerformanceSnapshot, ResourceProbe, SamplerHandle};

/// Unique, monotonically increasing request identifier
pub type RequestId = u64;

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestStatus {
    /// Admitted, waiting for a worker
    Queued,
    /// Taken by a worker (staged at the gate or generating)
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Queued => write!(f, "Queued"),
            RequestStatus::Running => write!(f, "Running"),
            RequestStatus::Completed => write!(f, "Completed"),
            RequestStatus::Failed => write!(f, "Failed"),
            RequestStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Final result of a completed request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub id: RequestId,
    /// Concatenation of every streamed fragment
    pub text: String,
    /// Characters generated
    pub chars: u64,
    /// Tokens generated (backend-reported, or the fragment count)
    pub tokens: u64,
    /// Time holding the engine
    pub elapsed: Duration,
    /// Time between admission and dequeue
    pub queue_wait: Duration,
}

impl Completion {
    pub fn chars_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.chars as f64 / secs
        } else {
            0.0
        }
    }
}

/// Caller's side of a submitted request
pub struct RequestHandle {
    id: RequestId,
    fragments: mpsc::UnboundedReceiver<String>,
    result: oneshot::Receiver<Result<Completion, SchedulerError>>,
    status: watch::Receiver<RequestStatus>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn status(&self) -> RequestStatus {
        *self.status.borrow()
    }

    /// Next streamed fragment, or `None` once the request has finished
    pub async fn next_fragment(&mut self) -> Option<String> {
        self.fragments.recv().await
    }

    /// Wait for the terminal result. Fragments not yet read are discarded.
    pub async fn wait(self) -> Result<Completion, SchedulerError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Shutdown),
        }
    }

    /// Wait for the next status change
    pub async fn status_changed(&mut self) -> RequestStatus {
        let _ = self.status.changed().await;
        *self.status.borrow_and_update()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).field("status", &self.status()).finish()
    }
}

pub struct Scheduler<B: InferenceBackend> {
    config: SchedulerConfig,
    queue: Arc<RequestQueue<Job>>,
    executor: SingleFlightExecutor<B>,
    metrics: Arc<MetricsAggregator>,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sampler: Mutex<Option<SamplerHandle>>,
}

impl<B: InferenceBackend> Scheduler<B> {
    /// Build the scheduler around `engine` and spawn its workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(engine: InferenceEngine<B>, config: SchedulerConfig) -> Self {
        let config = config.normalized();
        let metrics = Arc::new(MetricsAggregator::new());
        let queue = Arc::new(RequestQueue::new(config.queue_capacity, config.admission, metrics.clone()));
        let executor = SingleFlightExecutor::new(engine);

        let ctx = WorkerContext {
            queue: queue.clone(),
            executor: executor.clone(),
            metrics: metrics.clone(),
            dispatch: Arc::new(tokio::sync::Mutex::new(())),
        };
        let workers = (0..config.max_concurrent)
            .map(|worker_id| tokio::spawn(run_worker(worker_id, ctx.clone())))
            .collect();

        info!(
            workers = config.max_concurrent,
            capacity = config.queue_capacity,
            admission = %config.admission,
            "Scheduler started"
        );

        Self {
            config,
            queue,
            executor,
            metrics,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(workers),
            sampler: Mutex::new(None),
        }
    }

    /// Start sampling system resources into the metrics every
    /// `sample_interval`. Replaces a running sampler.
    pub fn start_resource_sampling<P: ResourceProbe>(&self, probe: P) {
        let handle = start_sampling(self.metrics.clone(), probe, self.config.sample_interval);
        *self.sampler.lock() = Some(handle);
    }

    /// Whether a resource sampler is running
    pub fn is_sampling(&self) -> bool {
        self.sampler.lock().as_ref().is_some_and(|sampler| sampler.is_running())
    }

    /// Submit a prompt.
    ///
    /// Returns `CapacityExceeded` immediately under the reject policy, and
    /// waits for capacity under the block policy. Never waits for the engine.
    pub async fn submit(&self, prompt: impl Into<String>) -> Result<RequestHandle, SchedulerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (fragments_tx, fragments_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(RequestStatus::Queued);
        let cancel = CancellationToken::new();

        let job = Job {
            prompt: prompt.into(),
            fragments: fragments_tx,
            result: result_tx,
            status: status_tx,
            cancel: cancel.clone(),
        };

        if let Err(e) = self.queue.enqueue(id, job).await {
            debug!(request_id = id, error = %e, "Request not admitted");
            return Err(e.into());
        }

        Ok(RequestHandle { id, fragments: fragments_rx, result: result_rx, status: status_rx, cancel })
    }

    /// Cancel a request.
    ///
    /// A queued request is removed and resolved as `Cancelled` without
    /// reaching the engine. A running request resolves as `Cancelled` right
    /// away and stops forwarding fragments; the engine is released, and the
    /// request's metrics recorded, when the native call returns. Terminal
    /// requests are unaffected.
    pub fn cancel(&self, handle: &RequestHandle) {
        handle.cancel.cancel();
        if let Some(queued) = self.queue.remove(handle.id) {
            drop(queued.permit);
            queued.payload.finish(Err(SchedulerError::Cancelled));
        }
    }

    pub fn metrics_snapshot(&self) -> PerformanceSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        self.metrics.clone()
    }

    /// Clear conversation history. Waits for the in-flight generation.
    pub async fn clear_history(&self) {
        self.executor.with_engine(|engine| engine.clear_history()).await;
    }

    /// Copy of the conversation history
    pub async fn history(&self) -> Vec<Message> {
        self.executor.with_engine(|engine| engine.history().snapshot()).await
    }

    /// Backend description, read under the gate
    pub async fn backend_description(&self) -> String {
        self.executor.with_engine(|engine| engine.backend().describe()).await
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.queue.is_closed()
    }

    /// Stop admission, cancel queued requests, let in-flight work finish,
    /// wait for workers and stop the sampler.
    pub async fn shutdown(&self) {
        if self.queue.is_closed() {
            return;
        }
        self.queue.close();

        let drained = self.queue.drain();
        let cancelled = drained.len();
        for queued in drained {
            drop(queued.permit);
            queued.payload.finish(Err(SchedulerError::Cancelled));
        }

        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        let sampler = self.sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop().await;
        }

        info!(cancelled_queued = cancelled, "Scheduler shut down");
    }
}

impl<B: InferenceBackend> Drop for Scheduler<B> {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and empty
        self.queue.close();
    }
}
