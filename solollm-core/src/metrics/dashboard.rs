//! Plain-text performance dashboard

use std::fmt::Write;

use colored::Colorize;

use super::PerformanceSnapshot;

const BAR_WIDTH: usize = 20;
const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Usage bar: green up to 60%, yellow up to 80%, red above
pub fn usage_bar(percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0);
    let filled = ((percent / 100.0) * BAR_WIDTH as f64) as usize;
    let bar = format!("[{}{}]", "█".repeat(filled), "▒".repeat(BAR_WIDTH - filled));

    if percent > 80.0 {
        bar.red().to_string()
    } else if percent > 60.0 {
        bar.yellow().to_string()
    } else {
        bar.green().to_string()
    }
}

fn format_uptime(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn gauge_line(out: &mut String, label: &str, percent: Option<f64>, used_gb: Option<f64>) {
    match (percent, used_gb) {
        (Some(p), Some(gb)) => {
            let _ = writeln!(out, "  • {label}: {p:5.1}% ({gb:.1}GB) {}", usage_bar(p));
        }
        (Some(p), None) => {
            let _ = writeln!(out, "  • {label}: {p:5.1}% {}", usage_bar(p));
        }
        (None, _) => {
            let _ = writeln!(out, "  • {label}: {}", "unavailable".dimmed());
        }
    }
}

/// Render the `/monitor` dashboard
pub fn format_dashboard(s: &PerformanceSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "{}", "🖥️  Performance Dashboard".cyan().bold());
    let _ = writeln!(out, "{}", RULE.yellow());

    let _ = writeln!(out, "{}", "📊 System resources:".green());
    gauge_line(&mut out, "CPU", s.cpu_percent, None);
    gauge_line(&mut out, "Memory", s.memory_percent, s.memory_used_gb);
    // No GPU line on hosts without one
    if s.gpu_percent.is_some() {
        gauge_line(&mut out, "GPU", s.gpu_percent, s.gpu_memory_used_gb);
    }

    let _ = writeln!(out, "{}", "🚀 Inference:".blue());
    let _ = writeln!(out, "  • Total requests: {}", s.total_requests);
    let _ = writeln!(out, "  • Active requests: {}", s.active_requests);
    let _ = writeln!(
        out,
        "  • Completed / failed / cancelled: {} / {} / {}",
        s.completed_requests, s.failed_requests, s.cancelled_requests
    );
    let _ = writeln!(out, "  • Queued: {} (rejected {})", s.queue_depth, s.rejected_requests);
    let _ = writeln!(out, "  • Avg response: {:.2}s", s.avg_response_time_secs);
    let _ = writeln!(
        out,
        "  • Speed: {:.1} tokens/s | {:.1} chars/s",
        s.tokens_per_second, s.chars_per_second
    );
    let _ = writeln!(out, "  • Uptime: {}", format_uptime(s.uptime_secs as u64));
    let _ = write!(out, "{}", RULE.yellow());

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsAggregator;

    #[test]
    fn test_usage_bar_fill() {
        colored::control::set_override(false);
        assert_eq!(usage_bar(0.0), format!("[{}]", "▒".repeat(20)));
        assert_eq!(usage_bar(50.0), format!("[{}{}]", "█".repeat(10), "▒".repeat(10)));
        assert_eq!(usage_bar(150.0), format!("[{}]", "█".repeat(20)));
    }

    #[test]
    fn test_uptime_format() {
        assert_eq!(format_uptime(0), "0:00:00");
        assert_eq!(format_uptime(3723), "1:02:03");
    }

    #[test]
    fn test_dashboard_marks_unavailable_gauges() {
        colored::control::set_override(false);
        let text = format_dashboard(&MetricsAggregator::new().snapshot());
        assert!(text.contains("CPU: unavailable"));
        assert!(text.contains("Total requests: 0"));
        assert!(!text.contains("GPU"));
    }
}
