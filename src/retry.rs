//! Transport-level retry policy.
//!
//! Exponential backoff with full jitter: the cap for attempt `n` is
//! `min(max_delay, base_delay * 2^n)` and the actual sleep is a uniform draw
//! from `[0, cap]`. Only errors in the transient set
//! ([`BackendError::is_transient`]) are retried; everything else is returned
//! to the caller on first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Default number of attempts, including the first call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound on any single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Backoff parameters for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay, doubled on every retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Cap applied before the jitter draw.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit parameters.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Upper bound of the delay that follows the failed attempt `attempt`
    /// (zero-based).
    pub fn cap_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Draws a full-jitter delay for the failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap_ms = self.cap_for(attempt).as_millis() as u64;
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=cap_ms))
    }

    /// Whether another attempt is allowed after `attempts_made` calls.
    pub fn should_retry(&self, error: &BackendError, attempts_made: u32) -> bool {
        error.is_transient() && attempts_made < self.max_attempts
    }
}

/// Runs `op` under `policy`, retrying transient errors.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    op: F,
) -> Result<T, BackendError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut delays = Vec::new();
    retry_transient_traced(policy, label, &mut delays, op).await
}

/// Same as [`retry_transient`] but records every backoff delay it slept.
pub async fn retry_transient_traced<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    delays: &mut Vec<Duration>,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(&err, attempt + 1) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    label = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient backend error, backing off"
                );
                delays.push(delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        label = label,
                        attempts = attempt + 1,
                        error = %err,
                        "Transient retries exhausted"
                    );
                }
                return Err(err);
            }
        }
    }
}

/// Serde helper storing durations as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
