//! End-to-end tests for the `solollm` binary
//!
//! These run without a model: they cover the informational flags and
//! argument validation.

use std::path::PathBuf;
use std::process::{Command, Output};

fn solollm(args: &[&str]) -> Output {
    let mut full = vec!["run", "--quiet", "--bin", "solollm", "--"];
    full.extend_from_slice(args);

    Command::new("cargo")
        .args(&full)
        .current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")).parent().unwrap())
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run solollm")
}

#[test]
fn test_list_backends() {
    let output = solollm(&["--list-backends"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    println!("stdout: {}", stdout);

    assert!(output.status.success(), "Command failed: {}", stderr);
    assert!(stdout.contains("Compute backends"));
    for backend in ["cpu", "cuda", "opencl", "metal"] {
        assert!(stdout.contains(backend), "Missing backend {backend}");
    }
    assert!(stdout.contains("recommended"));
}

#[test]
fn test_system_info() {
    let output = solollm(&["--system-info"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    println!("stdout: {}", stdout);

    assert!(output.status.success(), "Command failed: {}", stderr);
    assert!(stdout.contains("System Information"));
    assert!(stdout.contains("CPU"));
    assert!(stdout.contains("Memory"));
    assert!(stdout.contains("Recommended backend"));
}

#[test]
fn test_system_info_json() {
    let output = solollm(&["--system-info", "--json"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "Command failed: {}", stderr);

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("Invalid JSON in --system-info output");
    assert!(value.get("platform").is_some(), "Missing platform field");
    assert!(value["cpu_count"].as_u64().unwrap() >= 1);
}

#[test]
fn test_concurrent_out_of_range() {
    for value in ["0", "9"] {
        let output = solollm(&["--concurrent", value, "--list-backends"]);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert!(!output.status.success(), "--concurrent {value} was accepted");
        assert!(stderr.contains("--concurrent"), "Unexpected error: {stderr}");
    }
}

#[test]
fn test_missing_model_fails_cleanly() {
    let output = solollm(&["--model", "/nonexistent/model.gguf", "--prompt", "hi"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("Model file not found"), "Unexpected error: {stderr}");
}
