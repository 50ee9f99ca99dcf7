//! Configuration for the request scheduler.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::DEFAULT_MAX_EXCHANGES;
use crate::metrics::sampler::DEFAULT_SAMPLE_INTERVAL;

/// Highest supported worker count
pub const MAX_WORKERS: usize = 8;

/// Default admission ceiling per worker
pub const DEFAULT_QUEUE_FACTOR: usize = 4;

/// What `submit` does when Queued + Running has reached the ceiling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Wait for capacity (backpressure)
    #[default]
    Block,
    /// Fail fast with `CapacityExceeded`
    Reject,
}

impl fmt::Display for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionPolicy::Block => f.write_str("block"),
            AdmissionPolicy::Reject => f.write_str("reject"),
        }
    }
}

impl FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(AdmissionPolicy::Block),
            "reject" => Ok(AdmissionPolicy::Reject),
            other => Err(format!("unknown admission policy '{other}' (expected block or reject)")),
        }
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker tasks pulling from the queue (1..=8). More workers overlap
    /// staging and delivery; generation is still one at a time.
    pub max_concurrent: usize,

    /// Ceiling on Queued + Running requests
    pub queue_capacity: usize,

    pub admission: AdmissionPolicy,

    /// Exchanges retained in conversation history
    pub history_exchanges: usize,

    /// Resource sampler period
    pub sample_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::with_concurrency(1)
    }
}

impl SchedulerConfig {
    /// Default config for `workers` workers, with the ceiling derived from
    /// the queue factor. The worker count is clamped to `1..=MAX_WORKERS`.
    pub fn with_concurrency(workers: usize) -> Self {
        let max_concurrent = workers.clamp(1, MAX_WORKERS);
        Self {
            max_concurrent,
            queue_capacity: max_concurrent * DEFAULT_QUEUE_FACTOR,
            admission: AdmissionPolicy::Block,
            history_exchanges: DEFAULT_MAX_EXCHANGES,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    /// Single interactive user: one worker, shallow queue
    pub fn interactive() -> Self {
        Self { queue_capacity: 2, ..Self::with_concurrency(1) }
    }

    /// Several callers sharing one model: fail fast instead of piling up
    pub fn shared() -> Self {
        Self { admission: AdmissionPolicy::Reject, ..Self::with_concurrency(4) }
    }

    /// Apply `SOLOLLM_*` environment overrides on top of the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SOLOLLM_MAX_CONCURRENT") {
            if let Ok(n) = val.parse::<usize>() {
                config = Self { admission: config.admission, ..Self::with_concurrency(n) };
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_QUEUE_CAPACITY") {
            if let Ok(n) = val.parse() {
                config.queue_capacity = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_ADMISSION") {
            if let Ok(policy) = val.parse() {
                config.admission = policy;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_HISTORY_EXCHANGES") {
            if let Ok(n) = val.parse() {
                config.history_exchanges = n;
            }
        }

        if let Ok(val) = std::env::var("SOLOLLM_SAMPLE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                config.sample_interval = Duration::from_millis(ms);
            }
        }

        config.normalized()
    }

    /// Clamp fields into their valid ranges. The ceiling is never below the
    /// worker count.
    pub fn normalized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.clamp(1, MAX_WORKERS);
        self.queue_capacity = self.queue_capacity.max(self.max_concurrent);
        self.history_exchanges = self.history_exchanges.max(1);
        if self.sample_interval.is_zero() {
            self.sample_interval = DEFAULT_SAMPLE_INTERVAL;
        }
        self
    }
}
