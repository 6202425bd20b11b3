//! Retry with exponential backoff and jitter.
//!
//! Only errors the caller classifies as retryable are retried; everything else
//! is returned on the first failure. Callers bound the total time with an
//! outer `tokio::time::timeout`.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::TrustError;

/// Backoff settings for transient failures.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = until the caller's timeout fires)
    pub max_attempts: u32,
    /// Initial delay between attempts, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Run `operation` until it succeeds, fails terminally or runs out of attempts.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, TrustError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, TrustError>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay();

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                debug!(operation = %operation_name, error = %e, "Terminal failure, not retrying");
                return Err(e);
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay().as_secs_f64()),
                );
            }
        }
    }
}
