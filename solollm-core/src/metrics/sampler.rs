//! Periodic system resource sampling
//!
//! The sampler runs on its own task, decoupled from request handling. Each
//! tick moves the probe onto the blocking pool (sysinfo and `nvidia-smi` both
//! block), records the result, and moves the probe back.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::MetricsAggregator;
use crate::command::{self, SAMPLE_TIMEOUT};
use crate::error::{HardwareError, SampleError};
use crate::parser::nvidia::{self, NvidiaSmiParser};
use crate::parser::GpuUtilization;

/// Default sampling interval
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryUsage {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn used_gb(&self) -> f64 {
        self.used_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

/// One reading of every gauge; each gauge fails independently
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub cpu_percent: Result<f64, SampleError>,
    pub memory: Result<MemoryUsage, SampleError>,
    pub gpu: Result<GpuUtilization, SampleError>,
}

impl ResourceSample {
    pub fn errors(&self) -> impl Iterator<Item = &SampleError> {
        [self.cpu_percent.as_ref().err(), self.memory.as_ref().err(), self.gpu.as_ref().err()]
            .into_iter()
            .flatten()
    }
}

/// Source of resource readings. Implementations may block.
pub trait ResourceProbe: Send + 'static {
    fn sample(&mut self) -> ResourceSample;
}

/// Probe backed by `sysinfo` for CPU/memory and `nvidia-smi` for the GPU
pub struct SysinfoProbe {
    system: System,
    // Set once nvidia-smi is known to be missing, so it is not respawned every tick
    gpu_missing: Option<String>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu();
        Self { system, gpu_missing: None }
    }

    fn sample_gpu(&mut self) -> Result<GpuUtilization, SampleError> {
        if let Some(reason) = &self.gpu_missing {
            return Err(SampleError::unavailable("gpu", reason.clone()));
        }

        let mut cmd = std::process::Command::new("nvidia-smi");
        cmd.args(nvidia::UTILIZATION_QUERY);
        let result = command::run_with_timeout(&mut cmd, SAMPLE_TIMEOUT);
        if let command::CommandResult::SpawnError(e) = &result {
            let reason = format!("nvidia-smi not runnable: {e}");
            info!(%reason, "GPU sampling disabled");
            self.gpu_missing = Some(reason.clone());
            return Err(SampleError::unavailable("gpu", reason));
        }

        let out = result
            .into_stdout("nvidia-smi")
            .map_err(|e: HardwareError| SampleError::unavailable("gpu", e.to_string()))?;
        NvidiaSmiParser::parse_utilization(&out)
            .ok_or_else(|| SampleError::unavailable("gpu", "unrecognized nvidia-smi output"))
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu = self.system.global_cpu_info().cpu_usage() as f64;
        let cpu_percent = if cpu.is_finite() {
            Ok(cpu.clamp(0.0, 100.0))
        } else {
            Err(SampleError::unavailable("cpu", "no CPU usage reported"))
        };

        let total_bytes = self.system.total_memory();
        let memory = if total_bytes == 0 {
            Err(SampleError::unavailable("memory", "total memory reported as zero"))
        } else {
            Ok(MemoryUsage { used_bytes: self.system.used_memory(), total_bytes })
        };

        ResourceSample { cpu_percent, memory, gpu: self.sample_gpu() }
    }
}

/// Handle to a running sampler. Dropping it also stops sampling.
pub struct SamplerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Stop the sampler and wait for the in-progress sample, if any
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Sampler task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a task sampling `probe` into `metrics` every `interval`.
///
/// Must be called from within a Tokio runtime.
pub fn start_sampling<P: ResourceProbe>(
    metrics: Arc<MetricsAggregator>,
    probe: P,
    interval: Duration,
) -> SamplerHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut probe = probe;
        debug!(interval_ms = interval.as_millis() as u64, "Resource sampler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let metrics = metrics.clone();
            let sampled = tokio::task::spawn_blocking(move || {
                metrics.sample_system_resources(&mut probe);
                probe
            })
            .await;

            match sampled {
                Ok(p) => probe = p,
                Err(e) => {
                    warn!(error = %e, "Resource probe panicked, sampler stopping");
                    break;
                }
            }
        }
        debug!("Resource sampler stopped");
    });

    SamplerHandle { cancel, task: Some(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyGpuProbe {
        calls: Arc<AtomicUsize>,
    }

    impl ResourceProbe for FlakyGpuProbe {
        fn sample(&mut self) -> ResourceSample {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResourceSample {
                cpu_percent: Ok(12.5),
                memory: Ok(MemoryUsage { used_bytes: 1 << 30, total_bytes: 4 << 30 }),
                gpu: Err(SampleError::unavailable("gpu", "no device")),
            }
        }
    }

    #[test]
    fn test_memory_usage_math() {
        let mem = MemoryUsage { used_bytes: 2 << 30, total_bytes: 8 << 30 };
        assert_eq!(mem.percent(), 25.0);
        assert_eq!(mem.used_gb(), 2.0);
        assert_eq!(MemoryUsage { used_bytes: 1, total_bytes: 0 }.percent(), 0.0);
    }

    #[test]
    fn test_sysinfo_probe_reads_memory() {
        let mut probe = SysinfoProbe::new();
        let sample = probe.sample();
        let mem = sample.memory.unwrap();
        assert!(mem.total_bytes > 0);
        assert!(sample.cpu_percent.is_ok());
    }

    #[tokio::test]
    async fn test_sampler_degrades_failed_gauge() {
        let metrics = Arc::new(MetricsAggregator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = start_sampling(
            metrics.clone(),
            FlakyGpuProbe { calls: calls.clone() },
            Duration::from_millis(10),
        );

        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_running());
        handle.stop().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cpu_percent, Some(12.5));
        assert_eq!(snapshot.memory_percent, Some(25.0));
        assert_eq!(snapshot.gpu_percent, None);
        assert!(snapshot.last_sample.is_some());
    }

    #[tokio::test]
    async fn test_stop_halts_sampling() {
        let metrics = Arc::new(MetricsAggregator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = start_sampling(metrics, FlakyGpuProbe { calls: calls.clone() }, Duration::from_millis(5));

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }
}
