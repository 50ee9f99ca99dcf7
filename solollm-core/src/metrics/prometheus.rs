//! Prometheus text exposition of a [`PerformanceSnapshot`]
//!
//! The exporter owns its registry, so several schedulers in one process
//! (tests, embedding applications) never collide on metric names.

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use super::PerformanceSnapshot;

const NAMESPACE: &str = "solollm";

pub struct PrometheusExporter {
    registry: Registry,
    requests: IntGaugeVec,
    active_requests: IntGauge,
    queue_depth: IntGauge,
    rejected_requests: IntGauge,
    cancelled_while_queued: IntGauge,
    generated_tokens: IntGauge,
    generated_chars: IntGauge,
    avg_response_seconds: Gauge,
    tokens_per_second: Gauge,
    uptime_seconds: Gauge,
    cpu_percent: Gauge,
    memory_percent: Gauge,
    gpu_percent: Gauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl PrometheusExporter {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntGaugeVec::new(
            opts("requests_total", "Requests that reached the engine, by outcome"),
            &["status"],
        )?;
        let active_requests = IntGauge::with_opts(opts("active_requests", "Requests holding the engine"))?;
        let queue_depth = IntGauge::with_opts(opts("queue_size", "Requests waiting in the queue"))?;
        let rejected_requests =
            IntGauge::with_opts(opts("requests_rejected_total", "Requests rejected at admission"))?;
        let cancelled_while_queued = IntGauge::with_opts(opts(
            "requests_cancelled_queued_total",
            "Requests cancelled before reaching the engine",
        ))?;
        let generated_tokens = IntGauge::with_opts(opts("tokens_generated_total", "Tokens generated"))?;
        let generated_chars = IntGauge::with_opts(opts("chars_generated_total", "Characters generated"))?;
        let avg_response_seconds = Gauge::with_opts(opts(
            "response_time_seconds_avg",
            "Mean response time over the recent window",
        ))?;
        let tokens_per_second = Gauge::with_opts(opts("tokens_per_second", "Mean generation throughput"))?;
        let uptime_seconds = Gauge::with_opts(opts("uptime_seconds", "Seconds since the scheduler started"))?;
        let cpu_percent = Gauge::with_opts(opts("cpu_percent", "Host CPU utilization"))?;
        let memory_percent = Gauge::with_opts(opts("memory_percent", "Host memory utilization"))?;
        let gpu_percent = Gauge::with_opts(opts("gpu_percent", "GPU utilization"))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(rejected_requests.clone()))?;
        registry.register(Box::new(cancelled_while_queued.clone()))?;
        registry.register(Box::new(generated_tokens.clone()))?;
        registry.register(Box::new(generated_chars.clone()))?;
        registry.register(Box::new(avg_response_seconds.clone()))?;
        registry.register(Box::new(tokens_per_second.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(memory_percent.clone()))?;
        registry.register(Box::new(gpu_percent.clone()))?;

        Ok(Self {
            registry,
            requests,
            active_requests,
            queue_depth,
            rejected_requests,
            cancelled_while_queued,
            generated_tokens,
            generated_chars,
            avg_response_seconds,
            tokens_per_second,
            uptime_seconds,
            cpu_percent,
            memory_percent,
            gpu_percent,
        })
    }

    fn update(&self, s: &PerformanceSnapshot) {
        self.requests.with_label_values(&["completed"]).set(s.completed_requests as i64);
        self.requests.with_label_values(&["failed"]).set(s.failed_requests as i64);
        self.requests.with_label_values(&["cancelled"]).set(s.cancelled_requests as i64);
        self.active_requests.set(s.active_requests as i64);
        self.queue_depth.set(s.queue_depth as i64);
        self.rejected_requests.set(s.rejected_requests as i64);
        self.cancelled_while_queued.set(s.cancelled_while_queued as i64);
        self.generated_tokens.set(s.total_generated_tokens as i64);
        self.generated_chars.set(s.total_generated_chars as i64);
        self.avg_response_seconds.set(s.avg_response_time_secs);
        self.tokens_per_second.set(s.tokens_per_second);
        self.uptime_seconds.set(s.uptime_secs);
        // Unavailable gauges are exported as NaN
        self.cpu_percent.set(s.cpu_percent.unwrap_or(f64::NAN));
        self.memory_percent.set(s.memory_percent.unwrap_or(f64::NAN));
        self.gpu_percent.set(s.gpu_percent.unwrap_or(f64::NAN));
    }

    /// Render `snapshot` in the Prometheus text format
    pub fn render(&self, snapshot: &PerformanceSnapshot) -> String {
        self.update(snapshot);

        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("# Error encoding metrics: {}", e);
        }
        String::from_utf8(buf).unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsAggregator, RequestOutcome};
    use std::time::Duration;

    #[test]
    fn test_render_contains_core_gauges() {
        let metrics = MetricsAggregator::new();
        metrics.record_request_start();
        metrics.record_request_end(Duration::from_secs(2), 80, 20, RequestOutcome::Completed);
        metrics.record_rejected();

        let exporter = PrometheusExporter::new().unwrap();
        let text = exporter.render(&metrics.snapshot());

        assert!(text.contains("solollm_requests_total{status=\"completed\"} 1"));
        assert!(text.contains("solollm_active_requests 0"));
        assert!(text.contains("solollm_requests_rejected_total 1"));
        assert!(text.contains("solollm_tokens_per_second 10"));
        assert!(text.contains("solollm_gpu_percent NaN"));
    }

    #[test]
    fn test_exporters_do_not_share_registry() {
        let a = PrometheusExporter::new().unwrap();
        let b = PrometheusExporter::new().unwrap();
        let snapshot = MetricsAggregator::new().snapshot();
        assert_eq!(a.render(&snapshot), b.render(&snapshot));
    }
}
