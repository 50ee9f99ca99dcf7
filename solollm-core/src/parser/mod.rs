//! Parsers for external probe output
//!
//! Probe tools change their output across driver versions, so parsers return
//! `Option` and callers degrade to "unavailable" instead of failing.

pub mod nvidia;

pub use nvidia::NvidiaSmiParser;

/// Static GPU description used by hardware detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvidiaGpuInfo {
    /// GPU model name (e.g., "NVIDIA GeForce RTX 4090")
    pub name: String,
    /// Total VRAM in MB
    pub vram_total_mb: u64,
}

/// Point-in-time GPU load used by the resource sampler
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuUtilization {
    /// Core utilization in percent (0-100)
    pub utilization_percent: f64,
    /// VRAM in use, MB
    pub memory_used_mb: u64,
    /// Total VRAM, MB
    pub memory_total_mb: u64,
}

impl GpuUtilization {
    pub fn memory_used_gb(&self) -> f64 {
        self.memory_used_mb as f64 / 1024.0
    }
}
