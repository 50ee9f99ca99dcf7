use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use solollm_adapters_llamacpp::{default_binary, LlamaCppBackend, LlamaCppConfig};
use solollm_core::metrics::{format_dashboard, SysinfoProbe};
use solollm_core::{
    AdmissionPolicy, Backend, EngineConfig, GenerationParams, HardwareDetector, InferenceEngine, Scheduler,
    SchedulerConfig, SystemInfo,
};

mod chat;
mod report;

const DEFAULT_MODEL: &str = "models/qwen1_5-0_5b-chat-q4_0.gguf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    Auto,
    Cpu,
    Cuda,
    Opencl,
    Metal,
}

impl BackendArg {
    /// `None` lets the detector pick
    fn requested(self) -> Option<Backend> {
        match self {
            BackendArg::Auto => None,
            BackendArg::Cpu => Some(Backend::Cpu),
            BackendArg::Cuda => Some(Backend::Cuda),
            BackendArg::Opencl => Some(Backend::OpenCl),
            BackendArg::Metal => Some(Backend::Metal),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "solollm")]
#[command(version)]
#[command(about = "SoloLLM - many callers, one local quantized model", long_about = None)]
struct Cli {
    /// GGUF model file
    #[arg(short, long, default_value = DEFAULT_MODEL)]
    model: PathBuf,

    /// Compute backend
    #[arg(short, long, value_enum, default_value_t = BackendArg::Auto)]
    backend: BackendArg,

    /// Sampling temperature
    #[arg(short, long, default_value_t = 0.7)]
    temperature: f32,

    /// Maximum tokens per reply
    #[arg(short = 'l', long, default_value_t = 512)]
    max_tokens: u32,

    /// CPU threads (0 = auto)
    #[arg(short = 'j', long, default_value_t = 0)]
    threads: usize,

    /// Worker tasks serving requests (1-8)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=8))]
    concurrent: Option<u8>,

    /// Admission when the queue is full: block or reject
    #[arg(long)]
    admission: Option<AdmissionPolicy>,

    /// Exchanges kept in conversation history
    #[arg(long)]
    history: Option<usize>,

    /// Show the performance dashboard after each reply
    #[arg(long)]
    monitor: bool,

    /// Answer one prompt and exit
    #[arg(short, long)]
    prompt: Option<String>,

    /// List compute backends and exit
    #[arg(long)]
    list_backends: bool,

    /// Show system information and exit
    #[arg(long)]
    system_info: bool,

    /// Print --system-info / --list-backends as JSON
    #[arg(long)]
    json: bool,

    /// llama.cpp CLI binary
    #[arg(long, env = "SOLOLLM_LLAMA_CLI")]
    llama_cli: Option<PathBuf>,
}

impl Cli {
    /// Environment config with command-line overrides applied
    fn scheduler_config(&self) -> SchedulerConfig {
        let capacity_from_env = std::env::var("SOLOLLM_QUEUE_CAPACITY").is_ok_and(|v| v.parse::<usize>().is_ok());
        self.apply_overrides(SchedulerConfig::from_env(), capacity_from_env)
    }

    /// `-c` re-derives the queue ceiling from the worker count unless the
    /// ceiling was set explicitly
    fn apply_overrides(&self, mut config: SchedulerConfig, capacity_pinned: bool) -> SchedulerConfig {
        if let Some(workers) = self.concurrent {
            let derived = SchedulerConfig::with_concurrency(workers as usize);
            config.max_concurrent = derived.max_concurrent;
            if !capacity_pinned {
                config.queue_capacity = derived.queue_capacity;
            }
        }
        if let Some(policy) = self.admission {
            config.admission = policy;
        }
        if let Some(history) = self.history {
            config.history_exchanges = history;
        }
        config.normalized()
    }

    fn engine_config(&self, history_exchanges: usize) -> EngineConfig {
        EngineConfig {
            max_exchanges: history_exchanges,
            params: GenerationParams {
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                ..GenerationParams::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,solollm=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if cli.list_backends {
        let detector = HardwareDetector::detect();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report::backends_json(&detector))?);
        } else {
            report::print_backends(&detector);
        }
        return Ok(());
    }

    if cli.system_info {
        let info = SystemInfo::collect();
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            report::print_system_info(&info, &HardwareDetector::detect());
        }
        return Ok(());
    }

    let detector = HardwareDetector::detect();
    let backend_config = detector.select(cli.backend.requested()).with_threads(cli.threads);
    let binary = cli.llama_cli.clone().unwrap_or_else(default_binary);

    println!("{}", "🚀 SoloLLM".bold());
    println!("📦 Loading {} on {} ({})", cli.model.display(), backend_config.backend, backend_config);
    let llama = LlamaCppConfig::new(&cli.model, backend_config).with_binary(binary);
    let backend = LlamaCppBackend::load(llama).context("Failed to load model")?;

    let scheduler_config = cli.scheduler_config();
    let engine = InferenceEngine::new(backend, cli.engine_config(scheduler_config.history_exchanges));
    let scheduler = Arc::new(Scheduler::new(engine, scheduler_config));
    if cli.monitor {
        scheduler.start_resource_sampling(SysinfoProbe::new());
    }

    info!(
        workers = scheduler.config().max_concurrent,
        admission = %scheduler.config().admission,
        "Ready"
    );

    let outcome = match cli.prompt.clone() {
        Some(prompt) => one_shot(&scheduler, prompt, cli.monitor).await,
        None => chat::run(scheduler.clone(), cli.monitor).await,
    };

    scheduler.shutdown().await;
    outcome
}

async fn one_shot<B: solollm_core::InferenceBackend>(
    scheduler: &Scheduler<B>,
    prompt: String,
    monitor: bool,
) -> anyhow::Result<()> {
    let mut handle = scheduler.submit(prompt).await?;
    let mut stdout = std::io::stdout();

    while let Some(fragment) = handle.next_fragment().await {
        print!("{fragment}");
        stdout.flush()?;
    }
    let completion = handle.wait().await?;
    println!();
    println!(
        "{}",
        format!(
            "[{} chars, {} tokens in {:.1}s]",
            completion.chars,
            completion.tokens,
            completion.elapsed.as_secs_f64()
        )
        .dimmed()
    );

    if monitor {
        println!("{}", format_dashboard(&scheduler.metrics_snapshot()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["solollm"]);
        assert_eq!(cli.model, PathBuf::from(DEFAULT_MODEL));
        assert_eq!(cli.backend, BackendArg::Auto);
        assert_eq!(cli.max_tokens, 512);
        assert!(cli.concurrent.is_none());
    }

    #[test]
    fn test_concurrent_range() {
        assert!(Cli::try_parse_from(["solollm", "-c", "8"]).is_ok());
        assert!(Cli::try_parse_from(["solollm", "-c", "0"]).is_err());
        assert!(Cli::try_parse_from(["solollm", "--concurrent", "9"]).is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from(["solollm", "-c", "3", "--admission", "reject", "--history", "2", "-t", "0.2"]);
        let config = cli.scheduler_config();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.admission, AdmissionPolicy::Reject);
        assert_eq!(config.history_exchanges, 2);

        let engine = cli.engine_config(config.history_exchanges);
        assert_eq!(engine.max_exchanges, 2);
        assert_eq!(engine.params.temperature, 0.2);
    }

    #[test]
    fn test_concurrent_keeps_explicit_queue_capacity() {
        let base = SchedulerConfig { queue_capacity: 20, ..SchedulerConfig::default() };
        let cli = Cli::parse_from(["solollm", "-c", "2"]);

        let pinned = cli.apply_overrides(base.clone(), true);
        assert_eq!(pinned.max_concurrent, 2);
        assert_eq!(pinned.queue_capacity, 20);

        let derived = cli.apply_overrides(base, false);
        assert_eq!(derived.queue_capacity, 2 * solollm_core::batcher::DEFAULT_QUEUE_FACTOR);
    }

    #[test]
    fn test_concurrent_keeps_other_env_settings() {
        let base = SchedulerConfig {
            admission: AdmissionPolicy::Reject,
            history_exchanges: 3,
            ..SchedulerConfig::default()
        };
        let config = Cli::parse_from(["solollm", "-c", "4"]).apply_overrides(base.clone(), false);

        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.admission, AdmissionPolicy::Reject);
        assert_eq!(config.history_exchanges, 3);
        assert_eq!(config.sample_interval, base.sample_interval);
    }

    #[test]
    fn test_backend_arg() {
        let cli = Cli::parse_from(["solollm", "-b", "opencl"]);
        assert_eq!(cli.backend.requested(), Some(Backend::OpenCl));
        assert!(Cli::try_parse_from(["solollm", "-b", "vulkan"]).is_err());
    }
}
