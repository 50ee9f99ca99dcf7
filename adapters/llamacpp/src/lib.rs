//! llama.cpp backend for SoloLLM
//!
//! Runs the `llama-cli` binary against a GGUF model, one process per
//! generation, and streams its stdout as fragments. Token counts come from
//! the timing summary llama.cpp prints on stderr.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use solollm_core::command::{run_with_timeout, CommandResult, DEFAULT_TIMEOUT};
use solollm_core::engine::{GenerationParams, InferenceBackend, NativeStream};
use solollm_core::error::BackendError;
use solollm_core::hardware::BackendConfig;

pub mod stream;
pub mod timings;

pub use stream::ProcessStream;
pub use timings::{LlamaCppParser, LlamaMetrics};

/// Environment variable naming the llama.cpp binary
pub const LLAMA_CLI_ENV: &str = "SOLOLLM_LLAMA_CLI";

/// Binary looked up on `PATH` when nothing else is configured
pub const DEFAULT_LLAMA_CLI: &str = "llama-cli";

/// `SOLOLLM_LLAMA_CLI`, or `llama-cli`
pub fn default_binary() -> PathBuf {
    std::env::var_os(LLAMA_CLI_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LLAMA_CLI))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlamaCppConfig {
    /// llama.cpp CLI binary
    pub binary: PathBuf,
    /// GGUF model file
    pub model_path: PathBuf,
    pub backend: BackendConfig,
}

impl LlamaCppConfig {
    pub fn new(model_path: impl Into<PathBuf>, backend: BackendConfig) -> Self {
        Self { binary: default_binary(), model_path: model_path.into(), backend }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }
}

pub struct LlamaCppBackend {
    config: LlamaCppConfig,
}

impl LlamaCppBackend {
    /// Check the model file and the binary, then return a ready backend.
    pub fn load(config: LlamaCppConfig) -> Result<Self> {
        if !config.model_path.is_file() {
            bail!("Model file not found: {}", config.model_path.display());
        }

        let mut version = Command::new(&config.binary);
        version.arg("--version");
        match run_with_timeout(&mut version, DEFAULT_TIMEOUT) {
            CommandResult::SpawnError(e) => {
                return Err(e).with_context(|| {
                    format!(
                        "Failed to execute llama.cpp binary {} (set {} or --llama-cli)",
                        config.binary.display(),
                        LLAMA_CLI_ENV
                    )
                });
            }
            CommandResult::Timeout => {
                warn!(binary = %config.binary.display(), "llama.cpp version check timed out");
            }
            CommandResult::Success(_) => {}
        }

        info!(
            model = %config.model_path.display(),
            backend = %config.backend.backend,
            settings = %config.backend,
            "llama.cpp backend ready"
        );
        Ok(Self { config })
    }

    pub fn config(&self) -> &LlamaCppConfig {
        &self.config
    }

    pub fn model_name(&self) -> String {
        model_name(&self.config.model_path)
    }

    /// Command line for one generation
    fn args(&self, prompt: &str, params: &GenerationParams) -> Vec<String> {
        let backend = &self.config.backend;
        vec![
            "-m".to_string(),
            self.config.model_path.display().to_string(),
            "-p".to_string(),
            prompt.to_string(),
            "-n".to_string(),
            params.max_tokens.to_string(),
            "--temp".to_string(),
            params.temperature.to_string(),
            "--top-p".to_string(),
            params.top_p.to_string(),
            "--repeat-penalty".to_string(),
            params.repeat_penalty.to_string(),
            "-t".to_string(),
            backend.n_threads.to_string(),
            "-ngl".to_string(),
            backend.n_gpu_layers.to_string(),
            "-c".to_string(),
            backend.n_ctx.to_string(),
            "--no-display-prompt".to_string(),
            "-no-cnv".to_string(),
        ]
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn stream<'a>(
        &'a mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Box<dyn NativeStream + 'a>, BackendError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(prompt, params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::start(format!("failed to launch {}: {e}", self.config.binary.display()))
        })?;

        let (Some(stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::start("llama.cpp output not captured"));
        };

        // Drained on its own thread so a full stderr pipe never stalls stdout
        let stderr = std::thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = stderr.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        });

        debug!(pid = child.id(), prompt_chars = prompt.len(), "llama.cpp started");
        Ok(Box::new(ProcessStream::new(child, stdout, stderr, params.stop.clone())))
    }

    fn describe(&self) -> String {
        format!("{} on {} ({})", self.model_name(), self.config.backend.backend, self.config.backend)
    }
}

fn model_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
