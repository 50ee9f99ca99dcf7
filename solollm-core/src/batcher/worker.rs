//! Worker loop: pull, stage at the gate, generate, report.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::queue::{QueuedRequest, RequestQueue};
use super::Job;
use crate::engine::InferenceBackend;
use crate::error::{BackendError, SchedulerError};
use crate::executor::SingleFlightExecutor;
use crate::metrics::{MetricsAggregator, RequestOutcome};
use crate::scheduler::Completion;

pub(crate) struct WorkerContext<B> {
    pub queue: Arc<RequestQueue<Job>>,
    pub executor: SingleFlightExecutor<B>,
    pub metrics: Arc<MetricsAggregator>,
    /// Held from pop until the gate is acquired
    pub dispatch: Arc<Mutex<()>>,
}

impl<B> Clone for WorkerContext<B> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            metrics: self.metrics.clone(),
            dispatch: self.dispatch.clone(),
        }
    }
}

/// What the blocking side of a generation reports back
enum Report {
    Completed { text: String, chars: u64, tokens: u64 },
    Failed(BackendError),
    Cancelled { chars: u64 },
}

pub(crate) async fn run_worker<B: InferenceBackend>(worker_id: usize, ctx: WorkerContext<B>) {
    debug!(worker_id, "Worker started");

    loop {
        let dispatch = ctx.dispatch.lock().await;
        let Some(queued) = ctx.queue.dequeue().await else {
            break;
        };
        let QueuedRequest { id, payload: job, timer, permit } = queued;
        job.mark_running();

        let access = match ctx.executor.acquire(&job.cancel).await {
            Ok(access) => access,
            Err(err) => {
                drop(dispatch);
                debug!(request_id = id, "Request cancelled before reaching the engine");
                drop(permit);
                job.finish(Err(err));
                continue;
            }
        };
        drop(dispatch);

        ctx.metrics.record_request_start();
        let started = Instant::now();
        debug!(worker_id, request_id = id, "Generation started");

        let prompt = job.prompt.clone();
        let fragments = job.fragments.clone();
        let cancel = job.cancel.clone();
        let run = access.run(move |engine| {
            let mut generation = match engine.generate(&prompt) {
                Ok(generation) => generation,
                Err(e) => return Report::Failed(e),
            };
            let mut chars = 0u64;
            loop {
                // Dropping `generation` abandons it: nothing is committed
                if cancel.is_cancelled() {
                    return Report::Cancelled { chars };
                }
                match generation.next() {
                    Some(Ok(fragment)) => {
                        chars += fragment.chars().count() as u64;
                        // A dropped handle does not stop the generation
                        let _ = fragments.send(fragment);
                    }
                    Some(Err(e)) => return Report::Failed(e),
                    None => break,
                }
            }
            Report::Completed { text: generation.reply().to_string(), chars, tokens: generation.token_count() }
        });
        tokio::pin!(run);

        // The caller hears about a cancel at once. The gate and the slot stay
        // taken until the backend call returns.
        let token = job.cancel.clone();
        let mut pending = Some(job);
        let mut report = tokio::select! {
            biased;
            report = &mut run => report,
            _ = token.cancelled() => {
                if let Some(job) = pending.take() {
                    debug!(request_id = id, "Cancelled while generating, waiting for the backend to yield");
                    job.finish(Err(SchedulerError::Cancelled));
                }
                run.await
            }
        };
        if pending.is_none() && !matches!(report, Ok(Report::Cancelled { .. })) {
            report = Ok(Report::Cancelled { chars: 0 });
        }

        let elapsed = started.elapsed();
        let (outcome, result) = match report {
            Ok(Report::Completed { text, chars, tokens }) => {
                ctx.metrics.record_request_end(elapsed, chars, tokens, RequestOutcome::Completed);
                let completion = Completion {
                    id,
                    text,
                    chars,
                    tokens,
                    elapsed,
                    queue_wait: timer.queue_wait_time(),
                };
                (RequestOutcome::Completed, Ok(completion))
            }
            Ok(Report::Failed(e)) => {
                warn!(request_id = id, error = %e, "Generation failed");
                ctx.metrics.record_request_end(elapsed, 0, 0, RequestOutcome::Failed);
                (RequestOutcome::Failed, Err(SchedulerError::from(e)))
            }
            Ok(Report::Cancelled { chars }) => {
                debug!(request_id = id, partial_chars = chars, "Generation cancelled");
                ctx.metrics.record_request_end(elapsed, 0, 0, RequestOutcome::Cancelled);
                (RequestOutcome::Cancelled, Err(SchedulerError::Cancelled))
            }
            Err(e) => {
                ctx.metrics.record_request_end(elapsed, 0, 0, RequestOutcome::Failed);
                (RequestOutcome::Failed, Err(e))
            }
        };

        info!(
            request_id = id,
            %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            wait_ms = timer.queue_wait_time().as_millis() as u64,
            "Request finished"
        );
        // Free the slot before the caller observes the result
        drop(permit);
        if let Some(job) = pending {
            job.finish(result);
        }
    }

    debug!(worker_id, "Worker stopped");
}
