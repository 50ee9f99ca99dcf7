//! Single-flight access to the inference engine.
//!
//! The engine lives inside the gate (a fair `tokio::sync::Mutex`), so it is
//! unreachable without holding it. Generation runs on the blocking pool
//! while the owned guard is held; the guard is dropped only when the native
//! call returns, even if the awaiting task was cancelled in the meantime.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::engine::{InferenceBackend, InferenceEngine};
use crate::error::SchedulerError;

pub struct SingleFlightExecutor<B> {
    gate: Arc<Mutex<InferenceEngine<B>>>,
}

impl<B> Clone for SingleFlightExecutor<B> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone() }
    }
}

impl<B: InferenceBackend> SingleFlightExecutor<B> {
    pub fn new(engine: InferenceEngine<B>) -> Self {
        Self { gate: Arc::new(Mutex::new(engine)) }
    }

    /// Wait for the gate. Waiters are served in arrival order.
    ///
    /// Returns `Cancelled` without touching the engine if `cancel` fires
    /// first, or has already fired.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ExclusiveAccess<B>, SchedulerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
            guard = self.gate.clone().lock_owned() => Ok(ExclusiveAccess { guard }),
        }
    }

    /// Acquire the gate and run `task` against the engine to completion
    pub async fn run_exclusive<T, F>(&self, cancel: &CancellationToken, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&mut InferenceEngine<B>) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.acquire(cancel).await?.run(task).await
    }

    /// Run a short maintenance closure (history access) under the gate
    pub async fn with_engine<T>(&self, f: impl FnOnce(&mut InferenceEngine<B>) -> T) -> T {
        let mut engine = self.gate.lock().await;
        f(&mut engine)
    }

    /// True while some task holds the gate
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

/// Proof of holding the gate
pub struct ExclusiveAccess<B> {
    guard: OwnedMutexGuard<InferenceEngine<B>>,
}

impl<B: InferenceBackend> ExclusiveAccess<B> {
    /// Run `task` on the blocking pool and release the gate when it returns
    pub async fn run<T, F>(self, task: F) -> Result<T, SchedulerError>
    where
        F: FnOnce(&mut InferenceEngine<B>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.guard;
        let joined = tokio::task::spawn_blocking(move || {
            let out = task(&mut guard);
            drop(guard);
            debug!("Gate released");
            out
        })
        .await;

        joined.map_err(|e| {
            error!(error = %e, "Exclusive task panicked");
            SchedulerError::generation(format!("generation task panicked: {e}"))
        })
    }
}
