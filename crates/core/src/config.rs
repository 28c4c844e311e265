use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Runner calls in flight across all projects
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Deadline for a single runner attempt
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Upper bound on how long a run loop sleeps between scheduling passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Live bus capacity; slower subscribers fall back to replay
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Requeue steps left in progress by a previous process at startup.
    /// Turn off when several processes share one database.
    #[serde(default = "default_recover_in_progress")]
    pub recover_in_progress: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_step_timeout_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_event_buffer() -> usize {
    1024
}

fn default_recover_in_progress() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            step_timeout_secs: default_step_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            event_buffer: default_event_buffer(),
            recover_in_progress: default_recover_in_progress(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
