//! Retry utilities for stage operations
//!
//! Two contracts built on one [`RetryConfig`]:
//!
//! - [`retry`] / [`retry_result`]: per-message granularity, bounded
//!   exponential backoff, retrying only errors the caller classifies as
//!   retryable.
//! - [`attach`]: the uniform startup contract every stage applies to its
//!   dependencies (bus, registry, store): a bounded number of attempts with
//!   a delay between them; exhaustion is an error the process exits non-zero
//!   on, never a silent continue.

use crate::error::{PipelineError, StageError, StageResult};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts (not counting the initial attempt)
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed delay)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed delay, no exponential growth
    pub fn fixed_delay(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry `attempt` (1-indexed; attempt 0 is the initial try)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // cap the exponent to keep the f64 math sane
        let capped = attempt.min(30);
        let millis = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped as i32 - 1);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Execute an async operation, retrying retryable [`StageError`]s with
/// bounded exponential backoff. Non-retryable errors return immediately.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> StageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StageResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Convenience wrapper mapping a non-stage error type through `Into<StageError>`
pub async fn retry_result<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> StageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<StageError>,
{
    retry(config, || {
        let fut = operation();
        async move { fut.await.map_err(Into::into) }
    })
    .await
}

/// Startup attachment settings: a bounded number of attempts with a fixed
/// delay between them
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Attach to a dependency at process startup.
///
/// Tries `operation` up to `config.attempts` times, sleeping `config.delay`
/// between attempts. Exhaustion returns [`PipelineError::AttachExhausted`];
/// the caller propagates it and the process exits non-zero so a supervisor
/// can restart it.
pub async fn attach<T, E, F, Fut>(
    dependency: &str,
    config: &AttachConfig,
    mut operation: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(dependency, attempt, "Attached after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt < attempts {
                    warn!(
                        dependency,
                        attempt,
                        attempts,
                        error = %last_error,
                        "Attach attempt failed, retrying"
                    );
                    tokio::time::sleep(config.delay).await;
                }
            }
        }
    }

    Err(PipelineError::AttachExhausted {
        dependency: dependency.to_string(),
        attempts,
        message: last_error,
    })
}
