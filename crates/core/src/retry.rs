//! Activity retry policy and timeouts.
//!
//! Applied by the broker when an attempt fails: the failed attempt's
//! number picks the backoff delay, and the policy decides whether another
//! attempt is scheduled at all.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Schedule-to-close timeout used for frame clustering.
pub const DEFAULT_SCHEDULE_TO_CLOSE: Duration = Duration::from_secs(10 * 60);

/// Exponential-backoff retry parameters for one activity invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Factor by which the delay grows after each failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on the delay between attempts.
    pub maximum_interval: Duration,
    /// Total attempts allowed, the first included. `0` means unlimited.
    pub maximum_attempts: u32,
    /// Error type names that are never retried.
    #[serde(default)]
    pub non_retryable_error_types: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 5,
            non_retryable_error_types: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `attempt` (1-based) failed:
    /// `initial_interval * coefficient^(attempt - 1)`, clamped to
    /// `maximum_interval`. Coefficients below 1 count as 1.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let max = self.maximum_interval;
        if self.initial_interval.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let secs = self.initial_interval.as_secs_f64() * factor;
        // Overflow and NaN both land on the cap.
        Duration::try_from_secs_f64(secs).map_or(max, |delay| delay.min(max))
    }

    /// Whether a failure of attempt `attempt` should be retried.
    pub fn should_retry(&self, attempt: u32, error_type: &str, non_retryable: bool) -> bool {
        if non_retryable || self.non_retryable_error_types.iter().any(|t| t == error_type) {
            return false;
        }
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }
}

/// Options attached to an activity when the workflow schedules it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Deadline for the whole invocation, retries included, measured from
    /// first scheduling. Expiry is terminal.
    pub schedule_to_close_timeout: Duration,
    /// Deadline for a single attempt. Expiry counts as a retryable failure.
    pub start_to_close_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            schedule_to_close_timeout: DEFAULT_SCHEDULE_TO_CLOSE,
            start_to_close_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}
