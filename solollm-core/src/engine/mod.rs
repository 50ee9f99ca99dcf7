//! Inference engine adapter
//!
//! [`InferenceEngine`] owns the native backend and the conversation history.
//! Its only generation entry point, [`InferenceEngine::generate`], returns a
//! [`Generation`]: a lazy, single-pass iterator of text fragments that
//! commits the exchange to history only once the backend stream is
//! exhausted. A failed or abandoned generation leaves history untouched.
//!
//! The engine is not synchronized. It is reachable only through the
//! single-flight executor, which serializes every call into it.

pub mod prompt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::conversation::{ConversationHistory, DEFAULT_MAX_EXCHANGES};
use crate::error::BackendError;

pub use prompt::{build_chatml, DEFAULT_SYSTEM_PROMPT};

/// Sampling parameters passed to the backend on every call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    /// Upper bound on generated tokens; the only bound on generation time
    pub max_tokens: u32,
    pub repeat_penalty: f32,
    /// Output is truncated at the first occurrence of any of these
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 512,
            repeat_penalty: 1.1,
            stop: vec![prompt::IM_END.to_string(), prompt::IM_START.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub system_prompt: String,
    /// Exchanges kept in history
    pub max_exchanges: usize,
    pub params: GenerationParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_exchanges: DEFAULT_MAX_EXCHANGES,
            params: GenerationParams::default(),
        }
    }
}

/// Streaming output of one native call.
///
/// Yields fragments in order, then `None`. An `Err` item ends the stream.
pub trait NativeStream: Iterator<Item = Result<String, BackendError>> {
    /// Token count reported by the backend, once the stream is exhausted.
    /// Backends that cannot report it return `None`.
    fn token_count(&self) -> Option<u64> {
        None
    }
}

/// The raw, blocking token-generation primitive of a loaded model
pub trait InferenceBackend: Send + 'static {
    /// Start generating a completion of `prompt`.
    ///
    /// The returned stream borrows the backend; it must be drained or dropped
    /// before the next call. Dropping it early must stop the native call.
    fn stream<'a>(
        &'a mut self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<Box<dyn NativeStream + 'a>, BackendError>;

    /// Short human-readable description for logs and `/stats`
    fn describe(&self) -> String {
        "native backend".to_string()
    }
}

pub struct InferenceEngine<B> {
    backend: B,
    history: ConversationHistory,
    config: EngineConfig,
}

impl<B: InferenceBackend> InferenceEngine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let history = ConversationHistory::new(config.max_exchanges);
        Self { backend, history, config }
    }

    /// Assemble the context for `user_input` and start generating.
    ///
    /// Backend start failures are returned immediately; nothing is recorded.
    pub fn generate(&mut self, user_input: &str) -> Result<Generation<'_>, BackendError> {
        let InferenceEngine { backend, history, config } = self;

        let full_prompt = build_chatml(&config.system_prompt, history.iter(), user_input);
        trace!(prompt_chars = full_prompt.len(), history = history.len(), "Assembled context");

        let stream = backend.stream(&full_prompt, &config.params)?;
        Ok(Generation {
            stream,
            history,
            user_input: user_input.to_string(),
            reply: String::new(),
            fragments: 0,
            state: GenerationState::Streaming,
        })
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        debug!("Conversation history cleared");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenerationState {
    Streaming,
    Finished,
    Failed,
}

/// Lazy fragment sequence of one generation. See the module docs.
pub struct Generation<'a> {
    stream: Box<dyn NativeStream + 'a>,
    history: &'a mut ConversationHistory,
    user_input: String,
    reply: String,
    fragments: u64,
    state: GenerationState,
}

impl Generation<'_> {
    /// Text produced so far
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// True once the backend stream ended and the exchange was committed
    pub fn is_finished(&self) -> bool {
        self.state == GenerationState::Finished
    }

    /// Backend-reported token count, or the number of fragments when the
    /// backend does not report one
    pub fn token_count(&self) -> u64 {
        self.stream.token_count().unwrap_or(self.fragments)
    }
}

impl Iterator for Generation<'_> {
    type Item = Result<String, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != GenerationState::Streaming {
            return None;
        }

        loop {
            match self.stream.next() {
                Some(Ok(fragment)) if fragment.is_empty() => continue,
                Some(Ok(fragment)) => {
                    self.reply.push_str(&fragment);
                    self.fragments += 1;
                    return Some(Ok(fragment));
                }
                Some(Err(e)) => {
                    self.state = GenerationState::Failed;
                    return Some(Err(e));
                }
                None => {
                    self.history.commit_exchange(self.user_input.as_str(), self.reply.trim());
                    self.state = GenerationState::Finished;
                    return None;
                }
            }
        }
    }
}
