//! Error types for the SoloLLM core library
//!
//! This module provides structured error types using `thiserror` for
//! type-safe error handling across the library.
//!
//! # Error Hierarchy
//!
//! ```text
//! SchedulerError      - what a submitter sees (capacity, generation, cancel)
//! ├── BackendError    - failures raised by the native streaming primitive
//! SampleError         - one resource gauge could not be read (never propagates)
//! HardwareError       - backend / system detection failures
//! ```
//!
//! # Usage
//!
//! Library code returns the specific error types. Application code should use
//! `anyhow` with context:
//!
//! ```rust,ignore
//! use anyhow::Context;
//!
//! let handle = scheduler.submit(prompt).await.context("Failed to submit prompt")?;
//! ```

use thiserror::Error;

/// Errors surfaced to callers of the scheduler.
///
/// Capacity and shutdown errors are returned synchronously from `submit`;
/// generation failures and cancellations are delivered through the
/// request handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Queue/worker ceiling reached under the reject-on-full policy
    #[error("Capacity exceeded: {limit} requests already queued or running")]
    CapacityExceeded { limit: usize },

    /// The native call failed; partial output was discarded
    #[error("Generation failed: {0}")]
    Generation(String),

    /// The request was cancelled by the caller or by shutdown
    #[error("Request cancelled")]
    Cancelled,

    /// The scheduler no longer accepts work
    #[error("Scheduler is shut down")]
    Shutdown,
}

impl SchedulerError {
    /// Create a generation failure error
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// True for the variant that means "I stopped this"
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<BackendError> for SchedulerError {
    fn from(err: BackendError) -> Self {
        Self::Generation(err.to_string())
    }
}

/// Errors raised by a native inference backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The backend could not start a generation
    #[error("Failed to start generation: {0}")]
    Start(String),

    /// The backend failed while streaming
    #[error("Stream interrupted: {0}")]
    Stream(String),

    /// The backend process or library reported a non-zero status
    #[error("Backend exited with {status}: {message}")]
    Exit { status: String, message: String },
}

impl BackendError {
    /// Create a start error
    pub fn start(msg: impl Into<String>) -> Self {
        Self::Start(msg.into())
    }

    /// Create a mid-stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

/// A single system gauge could not be read
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    /// The gauge has no source on this machine (e.g. no GPU)
    #[error("{gauge} gauge unavailable: {reason}")]
    Unavailable { gauge: &'static str, reason: String },
}

impl SampleError {
    /// Create an unavailable-gauge error
    pub fn unavailable(gauge: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable { gauge, reason: reason.into() }
    }
}

/// Errors that can occur during hardware detection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// GPU detection failed
    #[error("GPU detection failed: {0}")]
    GpuDetection(String),

    /// Command execution failed
    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Parsing error when reading hardware info
    #[error("Failed to parse {location}: {message}")]
    ParseError { location: String, message: String },

    /// Unknown backend name
    #[error("Unknown backend '{0}' (expected auto, cpu, cuda, opencl or metal)")]
    UnknownBackend(String),
}

impl HardwareError {
    /// Create a GPU detection error
    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::GpuDetection(msg.into())
    }

    /// Create a command failure error
    pub fn command(cmd: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CommandFailed { command: cmd.into(), message: msg.into() }
    }

    /// Create a parse error
    pub fn parse(location: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ParseError { location: location.into(), message: msg.into() }
    }
}
