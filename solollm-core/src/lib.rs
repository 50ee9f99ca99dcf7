// SoloLLM Core Library
//
// Concurrent request scheduling in front of a single-flight local model:
// queueing, dispatch, conversation history, metrics and hardware detection.

pub mod batcher;
pub mod command;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod metrics;
pub mod parser;
pub mod scheduler;

pub use batcher::{AdmissionPolicy, SchedulerConfig};
pub use conversation::{ConversationHistory, Message, Role};
pub use engine::{EngineConfig, GenerationParams, InferenceBackend, InferenceEngine, NativeStream};
pub use error::{BackendError, HardwareError, SampleError, SchedulerError};
pub use hardware::{Backend, BackendConfig, HardwareDetector, SystemInfo};
pub use metrics::{MetricsAggregator, PerformanceSnapshot, RequestOutcome};
pub use scheduler::{Completion, RequestHandle, RequestId, RequestStatus, Scheduler};
