//! Engine configuration.

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use studyphase_progress::TrackerConfig;

/// Errors loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid configuration JSON
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration for the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Progress tracker settings
    pub tracker: TrackerConfig,

    /// Event ingress settings
    pub ingress: IngressConfig,
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Set the tracker settings.
    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    /// Set the ingress settings.
    pub fn with_ingress(mut self, ingress: IngressConfig) -> Self {
        self.ingress = ingress;
        self
    }
}

/// Event ingress settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Events processed at the same time across all keys
    pub max_concurrent: usize,

    /// Attempts per event before it is dead-lettered
    pub max_attempts: u32,

    /// First retry delay
    pub initial_backoff_ms: u64,

    /// Retry delay cap
    pub max_backoff_ms: u64,

    /// How long a key's worker waits for more events before exiting
    pub idle_timeout_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            idle_timeout_ms: 30_000,
        }
    }
}

impl IngressConfig {
    /// Create the default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    /// Set the idle timeout of per-key workers.
    pub fn with_idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Delay before retry number `retry` (1-based): doubling, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}
