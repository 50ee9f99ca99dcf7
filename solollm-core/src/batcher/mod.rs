//! Request queuing and dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                submit() from many callers                │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │  admission (block / reject)
//!                    ┌────────▼────────┐
//!                    │  RequestQueue   │ ← FIFO, bounded by capacity
//!                    └────────┬────────┘
//!                             │  dispatch lock: pop + stage at gate
//!                    ┌────────▼────────┐
//!                    │  Worker pool    │ ← 1..=8 tokio tasks
//!                    └────────┬────────┘
//!                             │
//!                    ┌────────▼────────┐
//!                    │ SingleFlight    │ ← one generation at a time
//!                    │ Executor        │
//!                    └─────────────────┘
//! ```
//!
//! A worker pops a request and waits for the gate while still holding the
//! dispatch lock, so the order requests reach the engine is the order they
//! left the queue. Extra workers overlap delivery and bookkeeping with the
//! next generation; they never run generations in parallel.

mod config;
mod queue;
pub(crate) mod worker;

pub use config::{AdmissionPolicy, SchedulerConfig, DEFAULT_QUEUE_FACTOR, MAX_WORKERS};
pub use queue::{QueueError, QueuedRequest, RequestQueue, RequestTimer};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::scheduler::{Completion, RequestStatus};

/// Everything a worker needs to run one request and report back
pub(crate) struct Job {
    pub prompt: String,
    pub fragments: mpsc::UnboundedSender<String>,
    pub result: oneshot::Sender<Result<Completion, SchedulerError>>,
    pub status: watch::Sender<RequestStatus>,
    pub cancel: CancellationToken,
}

impl Job {
    pub fn mark_running(&self) {
        self.status.send_replace(RequestStatus::Running);
    }

    /// Publish the terminal status, then deliver the result
    pub fn finish(self, result: Result<Completion, SchedulerError>) {
        let status = match &result {
            Ok(_) => RequestStatus::Completed,
            Err(SchedulerError::Cancelled) => RequestStatus::Cancelled,
            Err(_) => RequestStatus::Failed,
        };
        self.status.send_replace(status);
        // The caller may have dropped its handle
        let _ = self.result.send(result);
    }
}
