//! `--list-backends` / `--system-info` output

use colored::Colorize;
use serde_json::{json, Value};
use solollm_core::{HardwareDetector, SystemInfo};

pub fn print_backends(detector: &HardwareDetector) {
    let best = detector.best_backend();

    println!("{}", "🔧 Compute backends".bold());
    for (backend, available) in detector.backends() {
        let mark = if available { "✓".green() } else { "✗".red() };
        let status = if available { "available" } else { "not available" };
        let suffix = if backend == best { " ⭐ recommended" } else { "" };
        println!("  {mark} {:<7} {status}{suffix}", backend.as_str());
    }
    println!();
    println!("⚙️  {}: {}", best, detector.optimal_config(best));
}

pub fn print_system_info(info: &SystemInfo, detector: &HardwareDetector) {
    println!("{}", "💻 System Information".bold());
    println!("  Platform: {} ({})", info.platform, info.arch);
    println!("  CPU: {} logical / {} physical cores", info.cpu_count, info.physical_cores);
    println!("  Memory: {:.1} GB", info.memory_total_gb);
    match (&info.gpu_name, info.gpu_memory_gb) {
        (Some(name), Some(gb)) => println!("  GPU: {name} ({gb:.1} GB VRAM)"),
        (Some(name), None) => println!("  GPU: {name}"),
        _ => println!("  GPU: none detected"),
    }

    let available: Vec<&str> = detector.available().iter().map(|b| b.as_str()).collect();
    println!("  Backends: {}", available.join(", "));
    println!("  Recommended backend: {}", detector.best_backend().to_string().cyan());
}

pub fn backends_json(detector: &HardwareDetector) -> Value {
    let best = detector.best_backend();
    let backends: Vec<Value> = detector
        .backends()
        .into_iter()
        .map(|(backend, available)| {
            json!({
                "name": backend.as_str(),
                "available": available,
                "config": available.then(|| detector.optimal_config(backend)),
            })
        })
        .collect();

    json!({ "recommended": best.as_str(), "backends": backends })
}
