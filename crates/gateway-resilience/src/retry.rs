//! Retry policy with exponential backoff.
//!
//! The delay before attempt `n + 1` is
//! `min(max_delay, initial_delay * 2^(n-1))`, widened by a symmetric jitter of
//! `jitter_factor` and clamped at zero. Cancellation and the call deadline are
//! checked before every sleep; a cancelled or expired call is never retried.

use gateway_core::{CallContext, GatewayError, GatewayResult};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Which errors are retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    /// Every non-terminal error
    #[default]
    Any,
    /// Only errors that report themselves retryable
    Retryable,
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the pre-jitter delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Error allow-list
    pub retry_on: RetryOn,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
            retry_on: RetryOn::Any,
        }
    }
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(mut config: RetryConfig) -> Self {
        config.max_attempts = config.max_attempts.max(1);
        config.jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a new builder
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Pre-jitter delay after failed attempt `attempt` (1-indexed)
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.config
            .initial_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay))
    }

    /// Jittered delay after failed attempt `attempt` (1-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt).as_secs_f64();
        let spread = base * self.config.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// Whether `error` may be retried under this policy
    #[must_use]
    pub fn should_retry(&self, error: &GatewayError) -> bool {
        if error.is_terminal() {
            return false;
        }
        match self.config.retry_on {
            RetryOn::Any => true,
            RetryOn::Retryable => error.is_retryable(),
        }
    }

    /// Execute an operation with retry logic
    ///
    /// # Errors
    /// The last attempt's error, or the context's cancellation/deadline error
    /// when it fires before a retry
    pub async fn execute<F, Fut, T>(&self, ctx: &CallContext, operation: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut attempt = 1;
        loop {
            ctx.check()?;

            let error = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt = attempt, "Retry succeeded");
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            if attempt >= self.config.max_attempts || !self.should_retry(&error) {
                return Err(error);
            }

            // Never sleep on behalf of a call that is already gone.
            ctx.check()?;
            let delay = self.delay_for_attempt(attempt);
            if delay >= ctx.remaining() {
                debug!(
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Deadline too close for another attempt"
                );
                return Err(error);
            }

            warn!(
                request_id = %ctx.request_id(),
                attempt = attempt,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                () = ctx.token().cancelled() => {
                    return Err(GatewayError::cancelled("call cancelled during backoff"));
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Set total attempts
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    /// Set initial delay
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set max delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set jitter factor
    #[must_use]
    pub fn jitter_factor(mut self, jitter: f64) -> Self {
        self.config.jitter_factor = jitter;
        self
    }

    /// Set the error allow-list
    #[must_use]
    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.config.retry_on = retry_on;
        self
    }

    /// Build the policy
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(300))
            .jitter_factor(0.0)
            .build()
    }

    fn transient() -> GatewayError {
        GatewayError::transport("p", "connection reset", None, true)
    }

    #[test]
    fn test_delay_calculation() {
        let policy = no_jitter(5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }

    #[test]
    fn test_base_delay_never_exceeds_max_and_never_decreases() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(7))
            .max_delay(Duration::from_secs(2))
            .build();
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = policy.base_delay_for_attempt(attempt);
            assert!(delay <= Duration::from_secs(2));
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(10))
            .jitter_factor(0.5)
            .build();
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_retry_allow_list() {
        let any = no_jitter(3);
        assert!(any.should_retry(&transient()));
        assert!(any.should_retry(&GatewayError::transport("p", "bad", Some(400), false)));
        assert!(!any.should_retry(&GatewayError::cancelled("gone")));
        assert!(!any.should_retry(&GatewayError::circuit_open("p")));

        let retryable = RetryPolicy::builder().retry_on(RetryOn::Retryable).build();
        assert!(retryable.should_retry(&transient()));
        assert!(!retryable.should_retry(&GatewayError::transport("p", "bad", Some(400), false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let policy = no_jitter(3);
        let ctx = CallContext::new("req-1", Duration::from_secs(30));
        let counter = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute(&ctx, || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(transient())
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("third attempt succeeds"), "ok");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_returns_last_error() {
        let policy = no_jitter(2);
        let ctx = CallContext::new("req-1", Duration::from_secs(30));
        let counter = Arc::new(AtomicU32::new(0));

        let result: GatewayResult<()> = policy
            .execute(&ctx, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Transport { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_after_cancellation() {
        let policy = no_jitter(5);
        let ctx = CallContext::new("req-1", Duration::from_secs(30));
        let counter = Arc::new(AtomicU32::new(0));
        let cancel = ctx.clone();

        let result: GatewayResult<()> = policy
            .execute(&ctx, || {
                let counter = Arc::clone(&counter);
                let cancel = cancel.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    cancel.cancel();
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result, Err(GatewayError::Cancelled { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_past_deadline() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(2))
            .jitter_factor(0.0)
            .build();
        let ctx = CallContext::new("req-1", Duration::from_secs(1));
        let counter = Arc::new(AtomicU32::new(0));

        let result: GatewayResult<()> = policy
            .execute(&ctx, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
