//! Bounded retry with exponential backoff.
//!
//! Every stage that talks to a collaborator wraps the call in
//! [`RetryPolicy::execute`]. Failures are classified through [`Retryable`]:
//! permanent errors are returned as-is on the first attempt, transient ones
//! are retried until the attempt budget runs out and then wrapped in
//! [`PipelineError::RetriesExhausted`].

use crate::error::{PipelineError, Result};
use bridge_traits::error::BridgeError;
use core_runtime::config::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Upper bound applied to every computed delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Classifies errors for [`RetryPolicy`].
pub trait Retryable {
    /// Whether running the same operation again may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for BridgeError {
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BridgeError::NotConfigured(_)
                | BridgeError::NotAvailable(_)
                | BridgeError::NotFound(_)
                | BridgeError::StaleRevision { .. }
        )
    }
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Bridge(err) => err.is_retryable(),
            PipelineError::Internal(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, exponential: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: DEFAULT_MAX_DELAY,
            exponential,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential: settings.exponential,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, false)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let delay = if self.exponential {
            let factor = 1u32
                .checked_shl(attempt.saturating_sub(1))
                .unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    ///
    /// The closure receives the 1-based attempt number. It is invoked at most
    /// `max_attempts` times.
    pub async fn execute<T, E, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Retryable + Into<PipelineError> + std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Giving up after final attempt"
                    );
                    return Err(PipelineError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e.into()),
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
