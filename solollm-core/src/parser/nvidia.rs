//! NVIDIA GPU information parser
//!
//! Parses the CSV form of `nvidia-smi --query-gpu=...` output. Only the first
//! GPU is reported; the model runs on device 0.

use super::{GpuUtilization, NvidiaGpuInfo};

/// Arguments for the detection query (name, total memory)
pub const INFO_QUERY: &[&str] = &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"];

/// Arguments for the sampling query (utilization, used memory, total memory)
pub const UTILIZATION_QUERY: &[&str] =
    &["--query-gpu=utilization.gpu,memory.used,memory.total", "--format=csv,noheader,nounits"];

/// Parser for nvidia-smi command output
pub struct NvidiaSmiParser;

impl NvidiaSmiParser {
    fn first_row(output: &str) -> Option<Vec<&str>> {
        let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
        Some(line.split(',').map(str::trim).collect())
    }

    /// Parse the [`INFO_QUERY`] output
    ///
    /// ```text
    /// NVIDIA GeForce RTX 4090, 24564
    /// ```
    pub fn parse_info(output: &str) -> Option<NvidiaGpuInfo> {
        let parts = Self::first_row(output)?;
        if parts.len() < 2 || parts[0].is_empty() {
            return None;
        }

        Some(NvidiaGpuInfo { name: parts[0].to_string(), vram_total_mb: parts[1].parse().ok()? })
    }

    /// Parse the [`UTILIZATION_QUERY`] output
    ///
    /// ```text
    /// 37, 1234, 24564
    /// ```
    ///
    /// Utilization may be reported as `[N/A]` on some boards, which yields `None`.
    pub fn parse_utilization(output: &str) -> Option<GpuUtilization> {
        let parts = Self::first_row(output)?;
        if parts.len() < 3 {
            return None;
        }

        let utilization_percent: f64 = parts[0].trim_end_matches('%').trim().parse().ok()?;
        Some(GpuUtilization {
            utilization_percent: utilization_percent.clamp(0.0, 100.0),
            memory_used_mb: parts[1].parse().ok()?,
            memory_total_mb: parts[2].parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTI_GPU_INFO: &str = "\
NVIDIA GeForce RTX 4090, 24564
NVIDIA GeForce RTX 3080, 10240
";

    #[test]
    fn test_parse_info() {
        let info = NvidiaSmiParser::parse_info("NVIDIA GeForce RTX 4090, 24564\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.vram_total_mb, 24564);
    }

    #[test]
    fn test_parse_info_reports_first_gpu() {
        let info = NvidiaSmiParser::parse_info(MULTI_GPU_INFO).unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
    }

    #[test]
    fn test_parse_info_skips_leading_blank_lines() {
        let info = NvidiaSmiParser::parse_info("\n\n  Tesla T4, 15360\n").unwrap();
        assert_eq!(info.name, "Tesla T4");
    }

    #[test]
    fn test_parse_info_invalid() {
        assert!(NvidiaSmiParser::parse_info("").is_none());
        assert!(NvidiaSmiParser::parse_info("   \n  ").is_none());
        assert!(NvidiaSmiParser::parse_info("only-a-name").is_none());
        assert!(NvidiaSmiParser::parse_info("name, lots").is_none());
    }

    #[test]
    fn test_parse_utilization() {
        let util = NvidiaSmiParser::parse_utilization("37, 1024, 24564\n").unwrap();
        assert_eq!(util.utilization_percent, 37.0);
        assert_eq!(util.memory_used_mb, 1024);
        assert_eq!(util.memory_total_mb, 24564);
        assert!((util.memory_used_gb() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_utilization_not_supported() {
        assert!(NvidiaSmiParser::parse_utilization("[N/A], 1024, 24564").is_none());
        assert!(NvidiaSmiParser::parse_utilization("37, 1024").is_none());
    }
}
