//! Per-call deadline and cancellation.

use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Generate a gateway request id
#[must_use]
pub fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

/// Deadline and cancellation signal carried by every call path
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: String,
    budget: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

impl CallContext {
    /// Create a context that expires `budget` from now
    #[must_use]
    pub fn new(request_id: impl Into<String>, budget: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            budget,
            deadline: Instant::now() + budget,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach to a parent cancellation token (e.g. server shutdown)
    #[must_use]
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Request id
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Absolute deadline
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancellation token for this call
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the call was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail if the call is cancelled or past its deadline
    ///
    /// # Errors
    /// `Cancelled` or `DeadlineExceeded`
    pub fn check(&self) -> GatewayResult<()> {
        if self.cancel.is_cancelled() {
            return Err(GatewayError::cancelled("call cancelled"));
        }
        if Instant::now() >= self.deadline {
            return Err(GatewayError::DeadlineExceeded {
                elapsed: self.budget,
            });
        }
        Ok(())
    }

    /// Run `fut`, abandoning it on cancellation or deadline
    ///
    /// # Errors
    /// The future's own error, `Cancelled` or `DeadlineExceeded`
    pub async fn run<T, F>(&self, fut: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(GatewayError::cancelled("call cancelled")),
            () = tokio::time::sleep_until(self.deadline) => Err(GatewayError::DeadlineExceeded {
                elapsed: self.budget,
            }),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons_future() {
        let ctx = CallContext::new("req-1", Duration::from_secs(1));
        let result: GatewayResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_cancel_abandons_future() {
        let ctx = CallContext::new("req-1", Duration::from_secs(60));
        ctx.cancel();
        let result: GatewayResult<u32> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(GatewayError::Cancelled { .. })));
        assert!(ctx.check().is_err());
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = CallContext::new("req-1", Duration::from_secs(60)).with_parent(&parent);
        assert!(ctx.check().is_ok());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_request_id_format() {
        assert!(new_request_id().starts_with("req-"));
    }
}
