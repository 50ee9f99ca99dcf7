//! Interactive chat loop

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;

use solollm_core::metrics::{format_dashboard, PrometheusExporter, SysinfoProbe};
use solollm_core::{HardwareDetector, InferenceBackend, Scheduler, SchedulerError, SystemInfo};

use crate::report;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatCommand {
    Help,
    Clear,
    Stats,
    Monitor,
    Backends,
    System,
    Metrics,
    Quit,
    Unknown(String),
}

impl ChatCommand {
    /// `None` when the line is a prompt, not a command
    fn parse(line: &str) -> Option<Self> {
        let word = line.strip_prefix('/')?.split_whitespace().next().unwrap_or("");
        let command = match word.to_ascii_lowercase().as_str() {
            "help" | "h" => ChatCommand::Help,
            "clear" | "c" => ChatCommand::Clear,
            "stats" | "s" => ChatCommand::Stats,
            "monitor" | "m" => ChatCommand::Monitor,
            "backends" | "b" => ChatCommand::Backends,
            "system" | "sys" => ChatCommand::System,
            "metrics" => ChatCommand::Metrics,
            "quit" | "q" | "exit" => ChatCommand::Quit,
            _ => ChatCommand::Unknown(word.to_string()),
        };
        Some(command)
    }
}

fn print_help() {
    println!("{}", "📖 Commands".bold());
    println!("  /help, /h        show this help");
    println!("  /clear, /c       clear conversation history");
    println!("  /stats, /s       show the performance dashboard");
    println!("  /monitor, /m     toggle the dashboard after each reply");
    println!("  /backends, /b    list compute backends");
    println!("  /system, /sys    show system information");
    println!("  /metrics         print metrics in Prometheus text format");
    println!("  /quit, /q, /exit leave");
    println!("  Ctrl-C           cancel the reply in progress");
}

pub async fn run<B: InferenceBackend>(scheduler: Arc<Scheduler<B>>, monitor: bool) -> Result<()> {
    let exporter = PrometheusExporter::new()?;
    let mut editor = DefaultEditor::new()?;
    let mut monitor = monitor;

    println!("🤖 {}", scheduler.backend_description().await);
    println!(
        "👥 {} worker(s), queue capacity {}, admission {}",
        scheduler.config().max_concurrent,
        scheduler.config().queue_capacity,
        scheduler.config().admission
    );
    println!("💡 Type /help for commands\n");

    loop {
        let line = tokio::task::block_in_place(|| editor.readline(&format!("{} ", "You>".green().bold())));
        let line = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if let Some(command) = ChatCommand::parse(input) {
            match command {
                ChatCommand::Help => print_help(),
                ChatCommand::Clear => {
                    scheduler.clear_history().await;
                    println!("🧹 Conversation history cleared");
                }
                ChatCommand::Stats => {
                    println!("🤖 {}", scheduler.backend_description().await);
                    println!("💬 {} messages in history", scheduler.history().await.len());
                    println!("{}", format_dashboard(&scheduler.metrics_snapshot()));
                }
                ChatCommand::Monitor => {
                    monitor = !monitor;
                    if monitor && !scheduler.is_sampling() {
                        scheduler.start_resource_sampling(SysinfoProbe::new());
                    }
                    println!("📈 Monitor {}", if monitor { "on" } else { "off" });
                }
                ChatCommand::Backends => report::print_backends(&HardwareDetector::detect()),
                ChatCommand::System => {
                    report::print_system_info(&SystemInfo::collect(), &HardwareDetector::detect())
                }
                ChatCommand::Metrics => print!("{}", exporter.render(&scheduler.metrics_snapshot())),
                ChatCommand::Quit => break,
                ChatCommand::Unknown(word) => println!("❓ Unknown command /{word}, try /help"),
            }
            continue;
        }

        ask(&scheduler, input).await?;
        if monitor {
            println!("{}", format_dashboard(&scheduler.metrics_snapshot()));
        }
    }

    println!("👋 Bye");
    Ok(())
}

/// Stream one reply to stdout. Ctrl-C cancels it.
async fn ask<B: InferenceBackend>(scheduler: &Scheduler<B>, input: &str) -> Result<()> {
    let mut handle = match scheduler.submit(input).await {
        Ok(handle) => handle,
        Err(e) => {
            println!("❌ {e}");
            return Ok(());
        }
    };
    debug!(request_id = handle.id(), "Submitted");

    let mut stdout = std::io::stdout();
    print!("{} ", "AI>".cyan().bold());
    stdout.flush()?;

    loop {
        tokio::select! {
            fragment = handle.next_fragment() => match fragment {
                Some(fragment) => {
                    print!("{fragment}");
                    stdout.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                scheduler.cancel(&handle);
                break;
            }
        }
    }

    match handle.wait().await {
        Ok(completion) => {
            println!();
            println!(
                "{}",
                format!(
                    "[{:.1}s, {:.1} chars/s]",
                    completion.elapsed.as_secs_f64(),
                    completion.chars_per_second()
                )
                .dimmed()
            );
        }
        Err(SchedulerError::Cancelled) => println!("\n⏹️  Cancelled"),
        Err(e) => println!("\n❌ {e}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands_and_aliases() {
        assert_eq!(ChatCommand::parse("/help"), Some(ChatCommand::Help));
        assert_eq!(ChatCommand::parse("/h"), Some(ChatCommand::Help));
        assert_eq!(ChatCommand::parse("/c"), Some(ChatCommand::Clear));
        assert_eq!(ChatCommand::parse("/sys"), Some(ChatCommand::System));
        assert_eq!(ChatCommand::parse("/s"), Some(ChatCommand::Stats));
        assert_eq!(ChatCommand::parse("/METRICS"), Some(ChatCommand::Metrics));
        assert_eq!(ChatCommand::parse("/exit"), Some(ChatCommand::Quit));
        assert_eq!(ChatCommand::parse("/q now"), Some(ChatCommand::Quit));
    }

    #[test]
    fn test_prompts_are_not_commands() {
        assert_eq!(ChatCommand::parse("hello /help"), None);
        assert_eq!(ChatCommand::parse("/nope"), Some(ChatCommand::Unknown("nope".into())));
    }
}
