//! Exponential backoff helpers
//!
//! [`retry_with_backoff`] retries a fallible async operation in place with
//! jittered delays. [`exponential_delay`] is the pure per-failure delay used by
//! the pool work queue's rate limiter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff parameters for [`retry_with_backoff`]
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one; 0 means retry forever
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays with a custom attempt limit
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds or the attempt limit is reached.
///
/// Each delay is multiplied by a random factor in `[0.5, 1.5)` so that
/// concurrent workers do not retry in lockstep. The last error is returned
/// when attempts run out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if config.max_attempts != 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "giving up after retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep_for = delay.mul_f64(jitter).min(config.max_delay);
                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = sleep_for.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::time::sleep(sleep_for).await;
                delay = delay
                    .mul_f64(config.backoff_multiplier)
                    .min(config.max_delay);
            }
        }
    }
}

/// Delay after `failures` consecutive failures: `base * 2^failures`, capped at `max`.
pub fn exponential_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    // 2^31 * any non-zero base already exceeds every sensible cap
    let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
