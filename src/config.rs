//! Configuration types for the durable execution engine.
//!
//! Engine-wide tunables live in [`EngineConfig`]; fan-out behavior is
//! configured per call through [`FanOutConfig`] and [`CompletionConfig`].

use std::time::Duration;

/// Engine-wide tunables for one invocation.
///
/// The cooldown window and the payload truncation threshold are deliberate
/// configuration, not contract: both exist so deployments can tune
/// suspend latency and store limits without code changes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum serialized size of one checkpoint batch in bytes
    /// (default: 750KB). An oversized single update still gets its own
    /// batch rather than blocking the queue forever.
    pub max_batch_size_bytes: usize,

    /// Cooldown before committing to a suspend decision (default: 10ms).
    /// Operations going idle within one window collapse into a single,
    /// correctly-prioritized termination request.
    pub suspend_cooldown: Duration,

    /// Result payloads above this size are dropped from the update and
    /// flagged for re-execution on replay (default: 256KB).
    pub payload_truncation_threshold: usize,

    /// Bounded wait for the checkpoint queue to drain during a forced
    /// flush (default: 30s). On expiry the queue is cleared and a local
    /// error is raised.
    pub queue_drain_timeout: Duration,

    /// Maximum attempts for a throttled (429) store write before the
    /// failure is classified for termination (default: 5).
    pub max_throttle_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_batch_size_bytes: 750 * 1024,
            suspend_cooldown: Duration::from_millis(10),
            payload_truncation_threshold: 256 * 1024,
            queue_drain_timeout: Duration::from_secs(30),
            max_throttle_retries: 5,
        }
    }
}

/// Retry policy for step operations.
///
/// Attempts are counted from 1; a policy with `max_attempts: 1` never
/// retries. Delays grow geometrically from `initial_delay` by
/// `backoff_rate`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 1s).
    pub initial_delay: Duration,
    /// Multiplier applied per subsequent retry (default: 2.0).
    pub backoff_rate: f64,
    /// Upper bound on any single delay (default: 60s).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_rate: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// A policy retrying up to `max_attempts` total attempts with default
    /// backoff.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// The delay before retry number `retry` (0-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_rate.powi(retry.min(32) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Completion policy for a fan-out run.
///
/// With no fields set the run fails fast on the first item failure and
/// succeeds only when every item completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionConfig {
    /// Minimum number of successful completions required.
    pub min_successful: Option<usize>,
    /// Maximum number of tolerated failures (absolute count).
    pub tolerated_failure_count: Option<usize>,
    /// Maximum percentage of tolerated failures (0.0 to 1.0).
    pub tolerated_failure_percentage: Option<f64>,
}

impl CompletionConfig {
    /// Completion config that succeeds when the first item succeeds.
    ///
    /// # Example
    ///
    /// ```
    /// use durable_engine::config::CompletionConfig;
    ///
    /// let config = CompletionConfig::first_successful();
    /// assert_eq!(config.min_successful, Some(1));
    /// ```
    pub fn first_successful() -> Self {
        Self {
            min_successful: Some(1),
            ..Default::default()
        }
    }

    /// Completion config that waits for all items to complete (fail fast).
    pub fn all_completed() -> Self {
        Self::default()
    }

    /// Completion config with a specific minimum successful count.
    pub fn min_successful(count: usize) -> Self {
        Self {
            min_successful: Some(count),
            ..Default::default()
        }
    }

    /// Completion config tolerating up to `count` item failures.
    pub fn tolerated_failure_count(count: usize) -> Self {
        Self {
            tolerated_failure_count: Some(count),
            ..Default::default()
        }
    }

    /// Completion config tolerating failures up to a fraction of the total.
    pub fn tolerated_failure_percentage(percentage: f64) -> Self {
        Self {
            tolerated_failure_percentage: Some(percentage),
            ..Default::default()
        }
    }

    /// Returns true if no policy field is configured.
    pub fn is_unconfigured(&self) -> bool {
        self.min_successful.is_none()
            && self.tolerated_failure_count.is_none()
            && self.tolerated_failure_percentage.is_none()
    }
}

/// Configuration for a fan-out (map/parallel) run.
#[derive(Debug, Clone, Default)]
pub struct FanOutConfig {
    /// Maximum number of simultaneously executing items (default: unbounded).
    pub max_concurrency: Option<usize>,
    /// Completion policy defining success/failure criteria.
    pub completion: CompletionConfig,
}

impl FanOutConfig {
    /// Creates a config with the given concurrency bound.
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: Some(max_concurrency),
            ..Default::default()
        }
    }

    /// Sets the completion policy.
    pub fn with_completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_batch_size_bytes, 750 * 1024);
        assert_eq!(config.suspend_cooldown, Duration::from_millis(10));
        assert_eq!(config.payload_truncation_threshold, 256 * 1024);
        assert_eq!(config.max_throttle_retries, 5);
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_rate: 2.0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        // capped by max_delay
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_policy_none() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn test_completion_config_unconfigured() {
        assert!(CompletionConfig::default().is_unconfigured());
        assert!(!CompletionConfig::first_successful().is_unconfigured());
        assert!(!CompletionConfig::tolerated_failure_count(3).is_unconfigured());
    }

    #[test]
    fn test_completion_config_constructors() {
        assert_eq!(CompletionConfig::min_successful(4).min_successful, Some(4));
        assert_eq!(
            CompletionConfig::tolerated_failure_percentage(0.25).tolerated_failure_percentage,
            Some(0.25)
        );
    }

    #[test]
    fn test_fan_out_config_builder() {
        let config = FanOutConfig::with_max_concurrency(2)
            .with_completion(CompletionConfig::min_successful(1));
        assert_eq!(config.max_concurrency, Some(2));
        assert_eq!(config.completion.min_successful, Some(1));
    }
}
