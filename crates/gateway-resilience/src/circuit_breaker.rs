//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascading failures by stopping requests
//! to a failing provider and allowing it time to recover.
//!
//! While closed, outcomes are counted over a rolling `interval`; after each
//! completed call the breaker opens once at least `min_requests` calls were
//! seen and the failure ratio reaches `failure_ratio`. An open breaker
//! rejects immediately until `timeout` elapses, then admits up to
//! `max_requests` concurrent probes. Any probe failure reopens it;
//! `max_requests` consecutive successes close it.

use chrono::{DateTime, Utc};
use gateway_core::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, testing if the provider recovered
    HalfOpen = 2,
}

impl CircuitState {
    /// Numeric encoding used by the `circuit_state` gauge
    #[must_use]
    pub fn as_gauge(self) -> i64 {
        self as i64
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Rolling window over which closed-state counts accumulate; zero never clears
    pub interval: Duration,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
    /// Concurrent probes admitted while half-open, and successes needed to close
    pub max_requests: u32,
    /// Minimum calls in the window before the ratio is considered
    pub min_requests: u32,
    /// Failure ratio that trips the circuit
    pub failure_ratio: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 1,
            min_requests: 3,
            failure_ratio: 0.6,
        }
    }
}

/// Counts for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Completed calls
    pub requests: u32,
    /// Successful calls
    pub total_successes: u32,
    /// Failed calls
    pub total_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Failures since the last success
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.requests = self.requests.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// Failure ratio over completed calls
    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Listener invoked on every state transition
pub type StateListener = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

/// How a guarded call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Provider answered
    Success,
    /// Provider failed
    Failure,
    /// Says nothing about the provider (caller cancelled)
    Ignored,
}

impl CallOutcome {
    /// Classify a call result
    #[must_use]
    pub fn of<T>(result: &GatewayResult<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) if e.is_cancellation() => Self::Ignored,
            Err(e) if e.is_upstream_fault() => Self::Failure,
            Err(_) => Self::Success,
        }
    }
}

struct Inner {
    state: CircuitState,
    counts: Counts,
    generation: u64,
    expiry: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    half_open_in_flight: u32,
    // Transitions made under the lock, reported once it is released.
    transitions: Vec<CircuitState>,
}

/// Circuit breaker for a single provider
pub struct CircuitBreaker {
    provider_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    listener: Option<StateListener>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(provider_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let expiry = (!config.interval.is_zero()).then(|| Instant::now() + config.interval);
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry,
                opened_at: None,
                half_open_in_flight: 0,
                transitions: Vec::new(),
            }),
            listener: None,
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, CircuitBreakerConfig::default())
    }

    /// Attach a state transition listener
    #[must_use]
    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get the provider ID
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.with_inner(|inner, now| self.current_state(inner, now))
    }

    /// Check if the circuit allows requests, without taking a probe slot
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` if the circuit is open
    pub fn check(&self) -> GatewayResult<()> {
        match self.state() {
            CircuitState::Open => Err(GatewayError::circuit_open(&self.provider_id)),
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Admit one call
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` when open, or when half-open with
    /// every probe slot taken
    pub fn before_call(&self) -> GatewayResult<CallPermit<'_>> {
        self.with_inner(|inner, now| {
            let half_open = match self.current_state(inner, now) {
                CircuitState::Open => {
                    return Err(GatewayError::circuit_open(&self.provider_id));
                }
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight >= self.config.max_requests {
                        debug!(
                            provider = %self.provider_id,
                            in_flight = inner.half_open_in_flight,
                            "Circuit breaker half-open, probe slots exhausted"
                        );
                        return Err(GatewayError::circuit_open(&self.provider_id));
                    }
                    inner.half_open_in_flight += 1;
                    true
                }
                CircuitState::Closed => false,
            };

            Ok(CallPermit {
                breaker: self,
                generation: inner.generation,
                half_open,
                done: false,
            })
        })
    }

    /// Run `operation` under the breaker
    ///
    /// # Errors
    /// `CircuitOpen` without invoking `operation`, or the operation's error
    pub async fn execute<F, Fut, T>(&self, operation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let permit = self.before_call()?;
        let result = operation().await;
        permit.finish(CallOutcome::of(&result));
        result
    }

    fn after_call(&self, generation: u64, half_open: bool, outcome: CallOutcome) {
        self.with_inner(|inner, now| {
            let state = self.current_state(inner, now);

            if generation != inner.generation {
                return;
            }
            if half_open {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }

            match outcome {
                CallOutcome::Ignored => {}
                CallOutcome::Success => {
                    inner.counts.on_success();
                    match state {
                        CircuitState::Closed => self.evaluate_trip(inner, now),
                        CircuitState::HalfOpen => {
                            debug!(
                                provider = %self.provider_id,
                                successes = inner.counts.consecutive_successes,
                                threshold = self.config.max_requests,
                                "Circuit breaker half-open success"
                            );
                            if inner.counts.consecutive_successes >= self.config.max_requests {
                                self.set_state(inner, CircuitState::Closed, now);
                            }
                        }
                        CircuitState::Open => {}
                    }
                }
                CallOutcome::Failure => {
                    inner.counts.on_failure();
                    match state {
                        CircuitState::Closed => self.evaluate_trip(inner, now),
                        CircuitState::HalfOpen => {
                            debug!(
                                provider = %self.provider_id,
                                "Circuit breaker half-open failure, reopening"
                            );
                            self.set_state(inner, CircuitState::Open, now);
                        }
                        CircuitState::Open => {}
                    }
                }
            }
        });
    }

    /// Run `f` under the lock, then report any transitions to the listener
    /// with the lock released
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner, Instant) -> T) -> T {
        let (out, transitions) = {
            let mut inner = self.inner.lock();
            let out = f(&mut inner, Instant::now());
            (out, std::mem::take(&mut inner.transitions))
        };
        if let Some(listener) = &self.listener {
            for state in transitions {
                listener(&self.provider_id, state);
            }
        }
        out
    }

    fn evaluate_trip(&self, inner: &mut Inner, now: Instant) {
        let counts = inner.counts;
        if counts.requests >= self.config.min_requests
            && counts.failure_ratio() >= self.config.failure_ratio
        {
            debug!(
                provider = %self.provider_id,
                requests = counts.requests,
                failures = counts.total_failures,
                "Circuit breaker failure ratio reached"
            );
            self.set_state(inner, CircuitState::Open, now);
        }
    }

    /// Apply time-driven transitions and return the effective state
    fn current_state(&self, inner: &mut Inner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut Inner, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }
        let previous = inner.state;
        inner.state = state;
        self.new_generation(inner, now);

        match state {
            CircuitState::Open => {
                inner.opened_at = Some(Utc::now());
                warn!(
                    provider = %self.provider_id,
                    from = %previous,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(provider = %self.provider_id, "Circuit breaker half-open, testing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                info!(provider = %self.provider_id, "Circuit breaker closed");
            }
        }

        if self.listener.is_some() {
            inner.transitions.push(state);
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts = Counts::default();
        inner.half_open_in_flight = 0;
        inner.expiry = match inner.state {
            CircuitState::Closed => {
                (!self.config.interval.is_zero()).then(|| now + self.config.interval)
            }
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        self.with_inner(|inner, now| {
            if inner.state == CircuitState::Closed {
                self.new_generation(inner, now);
            } else {
                self.set_state(inner, CircuitState::Closed, now);
            }
        });
        info!(provider = %self.provider_id, "Circuit breaker reset");
    }

    /// Snapshot of state and counts
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        self.with_inner(|inner, now| CircuitBreakerStatus {
            name: self.provider_id.clone(),
            state: self.current_state(inner, now),
            counts: inner.counts,
            opened_at: inner.opened_at,
        })
    }
}

/// Admission ticket for one guarded call.
///
/// Dropping a permit without finishing it releases its probe slot and
/// records nothing.
#[must_use = "finish the permit with the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    half_open: bool,
    done: bool,
}

impl CallPermit<'_> {
    /// Report the outcome of the call
    pub fn finish(mut self, outcome: CallOutcome) {
        self.done = true;
        self.breaker
            .after_call(self.generation, self.half_open, outcome);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker
                .after_call(self.generation, self.half_open, CallOutcome::Ignored);
        }
    }
}

/// Circuit breaker status as reported by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    /// Provider name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Counts in the current generation
    pub counts: Counts,
    /// When the circuit last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn trip_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            max_requests: 2,
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Err(GatewayError::transport("p", "boom", Some(500), true)) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> GatewayResult<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("test-provider");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_on_two_failures_in_three_calls() {
        let cb = CircuitBreaker::new("test-provider", trip_config());

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        // Below min_requests
        assert_eq!(cb.state(), CircuitState::Closed);

        // The trip check runs after a success too: 2/3 >= 0.6
        succeed(&cb).await.expect("call runs");
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let counter = AtomicU32::new(0);
        let invoked = &counter;
        let result = cb
            .execute(move || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(cb.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ratio_below_threshold_stays_closed() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        let _ = fail(&cb).await;
        for _ in 0..3 {
            succeed(&cb).await.expect("ok");
        }
        let _ = fail(&cb).await;
        // 2 / 5 = 0.4
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_clear_at_interval_end() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(cb.status().counts.requests, 0);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_max_requests() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let first = cb.before_call().expect("probe 1");
        let second = cb.before_call().expect("probe 2");
        assert!(matches!(
            cb.before_call(),
            Err(GatewayError::CircuitOpen { .. })
        ));

        first.finish(CallOutcome::Success);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        second.finish(CallOutcome::Success);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_timeout() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_releases_probe_slot() {
        let config = CircuitBreakerConfig {
            max_requests: 1,
            ..trip_config()
        };
        let cb = CircuitBreaker::new("test-provider", config);
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let permit = cb.before_call().expect("probe");
        assert!(cb.before_call().is_err());
        drop(permit);
        assert!(cb.before_call().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_do_not_trip() {
        let cb = CircuitBreaker::new("test-provider", trip_config());
        for _ in 0..5 {
            let _ = cb
                .execute(|| async {
                    Err::<(), _>(GatewayError::transport("p", "bad", Some(400), false))
                })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_listener() {
        let transitions = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&transitions);
        let cb = CircuitBreaker::new("test-provider", trip_config()).with_listener(Arc::new(
            move |_: &str, _: CircuitState| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.status().opened_at.is_some());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_may_call_back_into_breaker() {
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let cb = Arc::new_cyclic(|weak: &std::sync::Weak<CircuitBreaker>| {
            let weak = weak.clone();
            CircuitBreaker::new("reentrant", trip_config()).with_listener(Arc::new(
                move |_: &str, state: CircuitState| {
                    if let Some(cb) = weak.upgrade() {
                        sink.lock().push((state, cb.status().state));
                        if state == CircuitState::Open {
                            cb.reset();
                        }
                    }
                },
            ))
        });

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(
            *observed.lock(),
            vec![
                (CircuitState::Open, CircuitState::Open),
                (CircuitState::Closed, CircuitState::Closed),
            ]
        );
    }
}
