//! Hardware backend detection and tuning
//!
//! Decides which llama.cpp backend to run on and how to configure it. The
//! result is a [`BackendConfig`], which is read-only once the engine has
//! been constructed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::command::{self, DEFAULT_TIMEOUT};
use crate::error::HardwareError;
use crate::parser::nvidia::{self, NvidiaSmiParser};

/// Default context window passed to the backend
pub const DEFAULT_CONTEXT_LENGTH: u32 = 2048;

/// Upper bound on CPU threads handed to the backend
pub const MAX_CPU_THREADS: usize = 8;

/// Compute backends llama.cpp can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Cuda,
    OpenCl,
    Metal,
}

impl Backend {
    /// All backends in display order
    pub const ALL: [Backend; 4] = [Backend::Cpu, Backend::Cuda, Backend::OpenCl, Backend::Metal];

    /// Preference order used by automatic selection
    const PREFERENCE: [Backend; 4] = [Backend::Cuda, Backend::Metal, Backend::OpenCl, Backend::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Cuda => "cuda",
            Backend::OpenCl => "opencl",
            Backend::Metal => "metal",
        }
    }

    /// True if the backend offloads layers to a GPU
    pub fn uses_gpu(&self) -> bool {
        !matches!(self, Backend::Cpu)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Backend {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Backend::Cpu),
            "cuda" => Ok(Backend::Cuda),
            "opencl" => Ok(Backend::OpenCl),
            "metal" => Ok(Backend::Metal),
            other => Err(HardwareError::UnknownBackend(other.to_string())),
        }
    }
}

/// Backend tuning handed to the engine at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub backend: Backend,
    /// CPU threads used for generation
    pub n_threads: usize,
    /// Layers offloaded to the GPU (0 on CPU)
    pub n_gpu_layers: u32,
    /// Context window in tokens
    pub n_ctx: u32,
}

impl BackendConfig {
    /// Tuned defaults for `backend` on a machine with `cpu_count` logical CPUs
    pub fn optimal(backend: Backend, cpu_count: usize) -> Self {
        let (n_gpu_layers, n_threads) = match backend {
            Backend::Cpu => (0, cpu_count.clamp(1, MAX_CPU_THREADS)),
            Backend::Cuda => (32, 1),
            Backend::OpenCl => (16, 2),
            Backend::Metal => (32, 1),
        };

        Self { backend, n_threads, n_gpu_layers, n_ctx: DEFAULT_CONTEXT_LENGTH }
    }

    /// Override the thread count; `0` keeps the tuned value
    pub fn with_threads(mut self, threads: usize) -> Self {
        if threads > 0 {
            self.n_threads = threads;
        }
        self
    }
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n_gpu_layers={}, n_threads={}, n_ctx={}",
            self.n_gpu_layers, self.n_threads, self.n_ctx
        )
    }
}

/// Host description shown by `--system-info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub cpu_count: usize,
    pub physical_cores: usize,
    pub memory_total_gb: f64,
    pub gpu_name: Option<String>,
    pub gpu_memory_gb: Option<f64>,
}

impl SystemInfo {
    /// Collect host information; GPU fields stay `None` without nvidia-smi
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let gpu = match command::probe("nvidia-smi", nvidia::INFO_QUERY, DEFAULT_TIMEOUT) {
            Ok(out) => NvidiaSmiParser::parse_info(&out),
            Err(e) => {
                debug!(error = %e, "No NVIDIA GPU information");
                None
            }
        };

        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
            memory_total_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            gpu_name: gpu.as_ref().map(|g| g.name.clone()),
            gpu_memory_gb: gpu.map(|g| g.vram_total_mb as f64 / 1024.0),
        }
    }
}

/// Backend availability for the current host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareDetector {
    cpu_count: usize,
    cuda: bool,
    opencl: bool,
    metal: bool,
}

impl HardwareDetector {
    /// Probe the host. CUDA is detected by running `nvidia-smi`; OpenCL and
    /// Metal are assumed from the operating system.
    pub fn detect() -> Self {
        let cuda = match command::probe("nvidia-smi", &[], DEFAULT_TIMEOUT) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "CUDA unavailable");
                false
            }
        };
        let os = std::env::consts::OS;

        let detector = Self {
            cpu_count: num_cpus::get(),
            cuda,
            opencl: matches!(os, "linux" | "windows"),
            metal: os == "macos",
        };
        debug!(available = ?detector.available(), "Detected backends");
        detector
    }

    /// Detector with explicit availability (tests, forced configurations)
    pub fn with_availability(cpu_count: usize, cuda: bool, opencl: bool, metal: bool) -> Self {
        Self { cpu_count, cuda, opencl, metal }
    }

    pub fn is_available(&self, backend: Backend) -> bool {
        match backend {
            Backend::Cpu => true,
            Backend::Cuda => self.cuda,
            Backend::OpenCl => self.opencl,
            Backend::Metal => self.metal,
        }
    }

    /// Every backend with its availability, in display order
    pub fn backends(&self) -> Vec<(Backend, bool)> {
        Backend::ALL.iter().map(|b| (*b, self.is_available(*b))).collect()
    }

    pub fn available(&self) -> Vec<Backend> {
        Backend::ALL.into_iter().filter(|b| self.is_available(*b)).collect()
    }

    /// Best available backend: cuda, then metal, then opencl, then cpu
    pub fn best_backend(&self) -> Backend {
        Backend::PREFERENCE
            .into_iter()
            .find(|b| self.is_available(*b))
            .unwrap_or(Backend::Cpu)
    }

    pub fn optimal_config(&self, backend: Backend) -> BackendConfig {
        BackendConfig::optimal(backend, self.cpu_count)
    }

    /// Pick the backend to run on. `None` means automatic selection; an
    /// unavailable request falls back to the CPU.
    pub fn select(&self, requested: Option<Backend>) -> BackendConfig {
        let backend = match requested {
            None => self.best_backend(),
            Some(b) if self.is_available(b) => b,
            Some(b) => {
                warn!(requested = %b, "Requested backend unavailable, falling back to cpu");
                Backend::Cpu
            }
        };
        let config = self.optimal_config(backend);
        info!(backend = %config.backend, %config, "Selected backend");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_parse_and_display() {
        assert_eq!("cuda".parse::<Backend>().unwrap(), Backend::Cuda);
        assert_eq!(" OpenCL ".parse::<Backend>().unwrap(), Backend::OpenCl);
        assert_eq!(Backend::Metal.to_string(), "metal");
        assert!(matches!("tpu".parse::<Backend>(), Err(HardwareError::UnknownBackend(_))));
    }

    #[test]
    fn test_optimal_configs() {
        let cpu = BackendConfig::optimal(Backend::Cpu, 16);
        assert_eq!((cpu.n_gpu_layers, cpu.n_threads), (0, 8));
        assert_eq!(BackendConfig::optimal(Backend::Cpu, 4).n_threads, 4);

        let cuda = BackendConfig::optimal(Backend::Cuda, 16);
        assert_eq!((cuda.n_gpu_layers, cuda.n_threads), (32, 1));

        let opencl = BackendConfig::optimal(Backend::OpenCl, 16);
        assert_eq!((opencl.n_gpu_layers, opencl.n_threads), (16, 2));

        let metal = BackendConfig::optimal(Backend::Metal, 16);
        assert_eq!((metal.n_gpu_layers, metal.n_threads), (32, 1));
        assert_eq!(metal.n_ctx, DEFAULT_CONTEXT_LENGTH);
    }

    #[test]
    fn test_thread_override() {
        let config = BackendConfig::optimal(Backend::Cpu, 16);
        assert_eq!(config.clone().with_threads(0).n_threads, 8);
        assert_eq!(config.with_threads(3).n_threads, 3);
    }

    #[test]
    fn test_best_backend_preference() {
        let all = HardwareDetector::with_availability(8, true, true, true);
        assert_eq!(all.best_backend(), Backend::Cuda);

        let no_cuda = HardwareDetector::with_availability(8, false, true, true);
        assert_eq!(no_cuda.best_backend(), Backend::Metal);

        let opencl_only = HardwareDetector::with_availability(8, false, true, false);
        assert_eq!(opencl_only.best_backend(), Backend::OpenCl);

        let cpu_only = HardwareDetector::with_availability(8, false, false, false);
        assert_eq!(cpu_only.best_backend(), Backend::Cpu);
    }

    #[test]
    fn test_select_falls_back_to_cpu() {
        let detector = HardwareDetector::with_availability(4, false, false, false);
        assert_eq!(detector.select(Some(Backend::Cuda)).backend, Backend::Cpu);
        assert_eq!(detector.select(None).backend, Backend::Cpu);

        let detector = HardwareDetector::with_availability(4, true, false, false);
        assert_eq!(detector.select(Some(Backend::Cuda)).n_gpu_layers, 32);
    }

    #[test]
    fn test_cpu_always_available() {
        let detector = HardwareDetector::detect();
        assert!(detector.is_available(Backend::Cpu));
        assert_eq!(detector.backends().len(), 4);
    }

    #[test]
    fn test_system_info_collect() {
        let info = SystemInfo::collect();
        assert!(info.cpu_count >= 1);
        assert!(info.memory_total_gb > 0.0);
        assert!(!info.platform.is_empty());
    }
}
