//! Admission controller.
//!
//! Requests are checked against the route's sliding window first, then its
//! token bucket. The token check reserves the request's estimated cost;
//! [`AdmissionController::settle`] reconciles it with actual usage after the
//! call. Store calls are bounded by a timeout and guarded by a local circuit
//! breaker; when the store is unavailable the configured [`FailurePolicy`]
//! decides.

use crate::clock::Clock;
use crate::error::StoreError;
use crate::rules::{RateRule, RuleStore};
use crate::store::{request_key, token_key, BucketSpec, CounterStore};
use gateway_core::{ClientId, GatewayError, GatewayResult};
use gateway_resilience::{CircuitBreaker, CircuitBreakerConfig};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What to do when the counters store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and log a warning
    #[default]
    FailOpen,
    /// Deny the request
    FailClosed,
}

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Sliding window full
    RequestRate,
    /// Token bucket short
    TokenRate,
    /// Store unreachable under `FailClosed`
    StoreUnavailable,
}

impl DenyReason {
    /// Label for logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestRate => "request_rate",
            Self::TokenRate => "token_rate",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed
    Allowed,
    /// Reject with a retry hint
    Denied {
        /// Seconds to wait
        retry_after_secs: u64,
        /// Which limit denied
        reason: DenyReason,
    },
}

impl Admission {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert a denial into the client-facing error
    ///
    /// # Errors
    /// `RateLimitExceeded` when denied
    pub fn into_result(self) -> GatewayResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied {
                retry_after_secs,
                reason,
            } => Err(GatewayError::rate_limited(retry_after_secs, reason.as_str())),
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Bound on each store round trip
    pub store_timeout: Duration,
    /// Store outage behaviour
    pub failure_policy: FailurePolicy,
    /// Retry hint when none is computed
    pub default_retry_after_secs: u64,
    /// Upper bound on computed retry hints
    pub max_retry_after_secs: u64,
    /// Breaker around the store client
    pub store_breaker: CircuitBreakerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_millis(200),
            failure_policy: FailurePolicy::FailOpen,
            default_retry_after_secs: 30,
            max_retry_after_secs: 3600,
            store_breaker: CircuitBreakerConfig {
                timeout: Duration::from_secs(5),
                ..CircuitBreakerConfig::default()
            },
        }
    }
}

/// Per-client admission control
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    rules: Arc<RuleStore>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    config: AdmissionConfig,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Create a controller
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        rules: Arc<RuleStore>,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            format!("counters-store:{}", store.name()),
            config.store_breaker.clone(),
        );
        Self {
            store,
            rules,
            clock,
            breaker,
            config,
        }
    }

    /// Rule table in use
    #[must_use]
    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// Decide whether `client` may call `route` now
    pub async fn admit(&self, client: &ClientId, route: &str, estimated_tokens: u32) -> Admission {
        let rule = self.rules.get(route);

        let limit = rule.request_limit();
        if limit > 0 {
            let key = request_key(client, route);
            let window_ms = rule.window().as_millis() as u64;
            let now_ms = self.clock.now_ms();
            let hit = self
                .guarded(self.store.hit_sliding_window(&key, now_ms, window_ms, limit))
                .await;
            match hit {
                Ok(outcome) if !outcome.allowed => {
                    debug!(
                        client = %client,
                        route = route,
                        count = outcome.count,
                        limit = limit,
                        "Request rate exceeded"
                    );
                    return Admission::Denied {
                        retry_after_secs: self.config.default_retry_after_secs,
                        reason: DenyReason::RequestRate,
                    };
                }
                Ok(_) => {}
                Err(e) => return self.on_store_failure(client, route, &e),
            }
        }

        let capacity = rule.token_capacity();
        if capacity > 0 {
            let key = token_key(client, route);
            let spec = bucket_spec(&rule);
            let reservation = reservation(estimated_tokens, capacity);
            let now_secs = self.clock.now_secs();
            let taken = self
                .guarded(self.store.take_tokens(&key, spec, now_secs, reservation))
                .await;
            match taken {
                Ok(outcome) if !outcome.allowed => {
                    let retry_after = self.token_retry_after(reservation - outcome.tokens, spec);
                    debug!(
                        client = %client,
                        route = route,
                        requested = reservation,
                        available = outcome.tokens,
                        retry_after = retry_after,
                        "Token rate exceeded"
                    );
                    return Admission::Denied {
                        retry_after_secs: retry_after,
                        reason: DenyReason::TokenRate,
                    };
                }
                Ok(_) => {}
                Err(e) => return self.on_store_failure(client, route, &e),
            }
        }

        Admission::Allowed
    }

    /// Reconcile the token reservation made at admission with actual usage.
    ///
    /// Never fails the caller: store errors and overdrafts are logged.
    pub async fn settle(
        &self,
        client: &ClientId,
        route: &str,
        estimated_tokens: u32,
        actual_tokens: u32,
    ) {
        let rule = self.rules.get(route);
        let capacity = rule.token_capacity();
        if capacity == 0 {
            return;
        }

        let delta = f64::from(actual_tokens) - reservation(estimated_tokens, capacity);
        if delta.abs() < f64::EPSILON {
            return;
        }

        let key = token_key(client, route);
        let now_secs = self.clock.now_secs();
        match self
            .guarded(self.store.settle_tokens(&key, bucket_spec(&rule), now_secs, delta))
            .await
        {
            Ok(outcome) if outcome.overdraft > 0.0 => {
                warn!(
                    client = %client,
                    route = route,
                    estimated = estimated_tokens,
                    actual = actual_tokens,
                    overdraft = outcome.overdraft,
                    "Token bucket overdrawn after settlement"
                );
            }
            Ok(outcome) => {
                debug!(
                    client = %client,
                    route = route,
                    delta = delta,
                    tokens = outcome.tokens,
                    "Token usage settled"
                );
            }
            Err(e) => {
                warn!(
                    client = %client,
                    route = route,
                    error = %e,
                    "Token settlement skipped, store unavailable"
                );
            }
        }
    }

    async fn guarded<T, F>(&self, op: F) -> GatewayResult<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let timeout = self.config.store_timeout;
        self.breaker
            .execute(|| async move {
                match tokio::time::timeout(timeout, op).await {
                    Ok(result) => result.map_err(GatewayError::from),
                    Err(_) => Err(GatewayError::store(format!(
                        "counters store timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await
    }

    fn on_store_failure(&self, client: &ClientId, route: &str, error: &GatewayError) -> Admission {
        match self.config.failure_policy {
            FailurePolicy::FailOpen => {
                warn!(
                    client = %client,
                    route = route,
                    error = %error,
                    "Counters store unavailable, admitting request"
                );
                Admission::Allowed
            }
            FailurePolicy::FailClosed => {
                warn!(
                    client = %client,
                    route = route,
                    error = %error,
                    "Counters store unavailable, denying request"
                );
                Admission::Denied {
                    retry_after_secs: self.config.default_retry_after_secs,
                    reason: DenyReason::StoreUnavailable,
                }
            }
        }
    }

    fn token_retry_after(&self, deficit: f64, spec: BucketSpec) -> u64 {
        if spec.refill_per_sec <= 0.0 || !deficit.is_finite() {
            return self.config.default_retry_after_secs;
        }
        let secs = (deficit / spec.refill_per_sec).ceil();
        (secs as u64).clamp(1, self.config.max_retry_after_secs)
    }
}

/// Tokens reserved at admission: the estimate, at least 1 and at most the
/// bucket capacity so an oversized request is not denied forever
fn reservation(estimated_tokens: u32, capacity: u64) -> f64 {
    u64::from(estimated_tokens).clamp(1, capacity) as f64
}

fn bucket_spec(rule: &RateRule) -> BucketSpec {
    BucketSpec {
        capacity: rule.token_capacity() as f64,
        refill_per_sec: rule.refill_per_sec(),
        ttl_secs: u64::from(rule.window_seconds.max(1)).saturating_mul(2).max(60),
    }
}
