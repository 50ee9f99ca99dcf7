//! Thread-safe performance metrics.
//!
//! All counters live behind a single short-lived lock so a snapshot is
//! always internally consistent: `active_requests` and `total_requests` are
//! never observed mid-update relative to each other. The lock is never held
//! across a generation call.

pub mod dashboard;
pub mod prometheus;
pub mod sampler;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::SampleError;

pub use dashboard::format_dashboard;
pub use prometheus::PrometheusExporter;
pub use sampler::{start_sampling, ResourceProbe, ResourceSample, SamplerHandle, SysinfoProbe};

/// Number of recent response times used for the rolling average
pub const RESPONSE_TIME_WINDOW: usize = 100;

/// Terminal state of a request that reached the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestOutcome::Completed => "completed",
            RequestOutcome::Failed => "failed",
            RequestOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_requests: u64,
    active_requests: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,

    response_times: VecDeque<Duration>,
    generation_time: Duration,
    generated_chars: u64,
    generated_tokens: u64,

    queue_depth: u64,
    max_queue_depth: u64,
    queued_total: u64,
    rejected: u64,
    cancelled_in_queue: u64,
    total_queue_wait: Duration,
    dequeued_total: u64,

    cpu_percent: Option<f64>,
    memory_percent: Option<f64>,
    memory_used_gb: Option<f64>,
    gpu_percent: Option<f64>,
    gpu_memory_used_gb: Option<f64>,
    last_sample: Option<DateTime<Utc>>,
}

/// Point-in-time copy of every metric.
///
/// Resource gauges are `None` when the gauge has never been sampled or its
/// last sample failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSnapshot {
    pub total_requests: u64,
    pub active_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,

    /// Mean over the last [`RESPONSE_TIME_WINDOW`] responses, seconds
    pub avg_response_time_secs: f64,
    pub tokens_per_second: f64,
    pub chars_per_second: f64,
    pub total_generated_chars: u64,
    pub total_generated_tokens: u64,
    pub uptime_secs: f64,

    pub queue_depth: u64,
    pub max_queue_depth: u64,
    pub rejected_requests: u64,
    pub cancelled_while_queued: u64,
    pub avg_queue_wait_ms: f64,

    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub memory_used_gb: Option<f64>,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_used_gb: Option<f64>,
    pub last_sample: Option<DateTime<Utc>>,
}

impl PerformanceSnapshot {
    /// True when nothing is running and every started request has ended
    pub fn is_quiescent(&self) -> bool {
        self.active_requests == 0
            && self.total_requests
                == self.completed_requests + self.failed_requests + self.cancelled_requests
    }

    pub fn uptime(&self) -> Duration {
        Duration::from_secs_f64(self.uptime_secs)
    }
}

/// Aggregates request and resource metrics
#[derive(Debug)]
pub struct MetricsAggregator {
    counters: Mutex<Counters>,
    started_at: Instant,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self { counters: Mutex::new(Counters::default()), started_at: Instant::now() }
    }

    /// A request acquired the engine
    pub fn record_request_start(&self) {
        let mut c = self.counters.lock();
        c.total_requests += 1;
        c.active_requests += 1;
    }

    /// A started request reached a terminal state.
    ///
    /// `generated_chars` and `token_count` only feed the throughput figures
    /// for completed requests; failures and cancellations still record their
    /// elapsed time.
    pub fn record_request_end(
        &self,
        duration: Duration,
        generated_chars: u64,
        token_count: u64,
        outcome: RequestOutcome,
    ) {
        let mut c = self.counters.lock();
        if c.active_requests == 0 {
            warn!(%outcome, "Request end recorded without a matching start");
        }
        c.active_requests = c.active_requests.saturating_sub(1);

        if c.response_times.len() == RESPONSE_TIME_WINDOW {
            c.response_times.pop_front();
        }
        c.response_times.push_back(duration);

        match outcome {
            RequestOutcome::Completed => {
                c.completed += 1;
                c.generation_time += duration;
                c.generated_chars += generated_chars;
                c.generated_tokens += token_count;
            }
            RequestOutcome::Failed => c.failed += 1,
            RequestOutcome::Cancelled => c.cancelled += 1,
        }
    }

    /// A request was admitted to the queue
    pub fn record_queued(&self) {
        let mut c = self.counters.lock();
        c.queued_total += 1;
        c.queue_depth += 1;
        c.max_queue_depth = c.max_queue_depth.max(c.queue_depth);
    }

    /// A worker took a request off the queue after `wait`
    pub fn record_dequeued(&self, wait: Duration) {
        let mut c = self.counters.lock();
        c.queue_depth = c.queue_depth.saturating_sub(1);
        c.dequeued_total += 1;
        c.total_queue_wait += wait;
    }

    /// Admission refused under the reject policy
    pub fn record_rejected(&self) {
        self.counters.lock().rejected += 1;
    }

    /// A queued request was cancelled before any worker took it
    pub fn record_cancelled_in_queue(&self) {
        let mut c = self.counters.lock();
        c.queue_depth = c.queue_depth.saturating_sub(1);
        c.cancelled_in_queue += 1;
    }

    /// Store one resource sample. Failed gauges become unavailable.
    pub fn record_sample(&self, sample: ResourceSample) {
        let ResourceSample { cpu_percent, memory, gpu } = sample;

        let mut c = self.counters.lock();
        c.cpu_percent = cpu_percent.ok();
        match memory {
            Ok(mem) => {
                c.memory_percent = Some(mem.percent());
                c.memory_used_gb = Some(mem.used_gb());
            }
            Err(_) => {
                c.memory_percent = None;
                c.memory_used_gb = None;
            }
        }
        match gpu {
            Ok(gpu) => {
                c.gpu_percent = Some(gpu.utilization_percent);
                c.gpu_memory_used_gb = Some(gpu.memory_used_gb());
            }
            Err(_) => {
                c.gpu_percent = None;
                c.gpu_memory_used_gb = None;
            }
        }
        c.last_sample = Some(Utc::now());
    }

    /// Sample `probe` once and store the result. Never fails: gauge errors
    /// are logged and degrade to unavailable.
    pub fn sample_system_resources(&self, probe: &mut dyn ResourceProbe) {
        let sample = probe.sample();
        for err in sample.errors() {
            log_sample_error(err);
        }
        self.record_sample(sample);
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let uptime = self.started_at.elapsed();
        let c = self.counters.lock();

        let avg_response_time_secs = if c.response_times.is_empty() {
            0.0
        } else {
            c.response_times.iter().map(Duration::as_secs_f64).sum::<f64>()
                / c.response_times.len() as f64
        };

        let gen_secs = c.generation_time.as_secs_f64();
        let (tokens_per_second, chars_per_second) = if c.completed > 0 && gen_secs > 0.0 {
            (c.generated_tokens as f64 / gen_secs, c.generated_chars as f64 / gen_secs)
        } else {
            (0.0, 0.0)
        };

        let avg_queue_wait_ms = if c.dequeued_total == 0 {
            0.0
        } else {
            c.total_queue_wait.as_secs_f64() * 1000.0 / c.dequeued_total as f64
        };

        PerformanceSnapshot {
            total_requests: c.total_requests,
            active_requests: c.active_requests,
            completed_requests: c.completed,
            failed_requests: c.failed,
            cancelled_requests: c.cancelled,
            avg_response_time_secs,
            tokens_per_second,
            chars_per_second,
            total_generated_chars: c.generated_chars,
            total_generated_tokens: c.generated_tokens,
            uptime_secs: uptime.as_secs_f64(),
            queue_depth: c.queue_depth,
            max_queue_depth: c.max_queue_depth,
            rejected_requests: c.rejected,
            cancelled_while_queued: c.cancelled_in_queue,
            avg_queue_wait_ms,
            cpu_percent: c.cpu_percent,
            memory_percent: c.memory_percent,
            memory_used_gb: c.memory_used_gb,
            gpu_percent: c.gpu_percent,
            gpu_memory_used_gb: c.gpu_memory_used_gb,
            last_sample: c.last_sample,
        }
    }
}

fn log_sample_error(err: &SampleError) {
    // GPU absence is the normal case on most hosts
    match err {
        SampleError::Unavailable { gauge: "gpu", .. } => tracing::debug!(error = %err, "Gauge unavailable"),
        _ => warn!(error = %err, "Gauge unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::sampler::MemoryUsage;
    use crate::parser::GpuUtilization;

    #[test]
    fn test_start_end_pairing() {
        let metrics = MetricsAggregator::new();

        metrics.record_request_start();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 1);
        assert_eq!(snapshot.active_requests, 1);
        assert!(!snapshot.is_quiescent());

        metrics.record_request_end(Duration::from_millis(500), 40, 10, RequestOutcome::Completed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_requests, 0);
        assert_eq!(snapshot.completed_requests, 1);
        assert!(snapshot.is_quiescent());
    }

    #[test]
    fn test_speed_is_zero_until_completion() {
        let metrics = MetricsAggregator::new();
        assert_eq!(metrics.snapshot().tokens_per_second, 0.0);

        metrics.record_request_start();
        metrics.record_request_end(Duration::from_secs(2), 0, 0, RequestOutcome::Failed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tokens_per_second, 0.0);
        assert_eq!(snapshot.chars_per_second, 0.0);
        assert_eq!(snapshot.avg_response_time_secs, 2.0);
    }

    #[test]
    fn test_speed_uses_cumulative_generation_time() {
        let metrics = MetricsAggregator::new();
        for (secs, tokens) in [(1, 10), (3, 30)] {
            metrics.record_request_start();
            metrics.record_request_end(Duration::from_secs(secs), tokens * 4, tokens, RequestOutcome::Completed);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tokens_per_second, 10.0);
        assert_eq!(snapshot.chars_per_second, 40.0);
        assert_eq!(snapshot.total_generated_tokens, 40);
    }

    #[test]
    fn test_response_time_window() {
        let metrics = MetricsAggregator::new();
        for _ in 0..RESPONSE_TIME_WINDOW {
            metrics.record_request_start();
            metrics.record_request_end(Duration::from_secs(10), 0, 0, RequestOutcome::Completed);
        }
        for _ in 0..RESPONSE_TIME_WINDOW {
            metrics.record_request_start();
            metrics.record_request_end(Duration::from_secs(1), 0, 0, RequestOutcome::Completed);
        }

        assert_eq!(metrics.snapshot().avg_response_time_secs, 1.0);
    }

    #[test]
    fn test_queue_gauges() {
        let metrics = MetricsAggregator::new();
        for _ in 0..3 {
            metrics.record_queued();
        }
        metrics.record_dequeued(Duration::from_millis(100));
        metrics.record_cancelled_in_queue();
        metrics.record_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.max_queue_depth, 3);
        assert_eq!(snapshot.rejected_requests, 1);
        assert_eq!(snapshot.cancelled_while_queued, 1);
        assert_eq!(snapshot.avg_queue_wait_ms, 100.0);
        assert_eq!(snapshot.total_requests, 0);
    }

    #[test]
    fn test_failed_gauge_becomes_unavailable() {
        let metrics = MetricsAggregator::new();
        metrics.record_sample(ResourceSample {
            cpu_percent: Ok(25.0),
            memory: Ok(MemoryUsage { used_bytes: 4 << 30, total_bytes: 16 << 30 }),
            gpu: Ok(GpuUtilization { utilization_percent: 50.0, memory_used_mb: 2048, memory_total_mb: 8192 }),
        });
        assert_eq!(metrics.snapshot().gpu_percent, Some(50.0));

        metrics.record_sample(ResourceSample {
            cpu_percent: Ok(30.0),
            memory: Ok(MemoryUsage { used_bytes: 4 << 30, total_bytes: 16 << 30 }),
            gpu: Err(SampleError::unavailable("gpu", "driver gone")),
        });
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cpu_percent, Some(30.0));
        assert_eq!(snapshot.memory_percent, Some(25.0));
        assert_eq!(snapshot.memory_used_gb, Some(4.0));
        assert_eq!(snapshot.gpu_percent, None);
        assert!(snapshot.last_sample.is_some());
    }

    #[test]
    fn test_concurrent_updates_are_consistent() {
        let metrics = std::sync::Arc::new(MetricsAggregator::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        metrics.record_request_start();
                        metrics.record_request_end(Duration::from_millis(1), 1, 1, RequestOutcome::Completed);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2000);
        assert!(snapshot.is_quiescent());
    }
}
