use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with capped exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Retries granted to steps that do not set their own `maxRetries`
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            default_max_retries: default_max_retries(),
        }
    }
}

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`; `retry_count` is the step's new count
    Retry { retry_count: u32, delay: Duration },
    /// Attempts exhausted, the step fails for good
    GiveUp,
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^retries_so_far)`
    pub fn backoff(&self, retries_so_far: u32) -> Duration {
        let factor = 2u64.saturating_pow(retries_so_far);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Decide after a failed attempt of a step that has retried `retry_count` times
    pub fn decide(&self, retry_count: u32, max_retries: u32) -> RetryDecision {
        if retry_count < max_retries {
            RetryDecision::Retry {
                retry_count: retry_count + 1,
                delay: self.backoff(retry_count),
            }
        } else {
            RetryDecision::GiveUp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(63), Duration::from_secs(30));
    }

    #[test]
    fn test_decide_allows_exactly_max_retries() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.decide(0, 2),
            RetryDecision::Retry {
                retry_count: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            policy.decide(1, 2),
            RetryDecision::Retry { retry_count: 2, .. }
        ));
        assert_eq!(policy.decide(2, 2), RetryDecision::GiveUp);
        assert_eq!(policy.decide(0, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_policy_field_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"base_delay_ms": 250}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 30_000);
        assert_eq!(policy.default_max_retries, 2);
    }
}
