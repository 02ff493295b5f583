//! Dispatcher: model name to provider call.
//!
//! Each call resolves a provider, gates on its circuit breaker, then runs the
//! transport under the retry policy. Every attempt passes through the breaker
//! separately and runs under the call context's deadline.

use gateway_core::{
    CallContext, ChatRequest, ChatResponse, ChunkStream, GatewayError, GatewayResult,
};
use gateway_providers::{ProviderRegistry, Transport};
use gateway_resilience::{CircuitBreakerRegistry, RetryPolicy, StateListener};
use gateway_telemetry::Metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A successful dispatch
pub struct Dispatched<T> {
    /// Provider that served the call
    pub provider: String,
    /// Response or stream
    pub value: T,
}

impl<T> std::fmt::Debug for Dispatched<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Result of [`Dispatcher::dispatch`]
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Unary response
    Complete(Dispatched<ChatResponse>),
    /// Open upstream stream; content chunks only
    Stream(Dispatched<ChunkStream>),
}

/// Breaker listener that exports state to the `gateway_circuit_state` gauge
#[must_use]
pub fn circuit_state_listener(metrics: Metrics) -> StateListener {
    Arc::new(move |provider, state| {
        metrics.set_circuit_state(provider, state.as_gauge());
    })
}

/// Routes calls to providers
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

fn attempt_outcome<T>(result: &GatewayResult<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(GatewayError::CircuitOpen { .. }) => "circuit_open",
        Err(GatewayError::DeadlineExceeded { .. }) => "timeout",
        Err(e) if e.is_cancellation() => "cancelled",
        Err(_) => "error",
    }
}

/// Collapse the last attempt's error into what the caller sees
fn final_error(provider: &str, error: GatewayError) -> GatewayError {
    match error {
        GatewayError::CircuitOpen { provider } => {
            GatewayError::provider_unavailable(Some(provider), "circuit breaker open", true)
        }
        e @ (GatewayError::UpstreamProtocol { .. }
        | GatewayError::Cancelled { .. }
        | GatewayError::DeadlineExceeded { .. }
        | GatewayError::Validation { .. }
        | GatewayError::UnsupportedModel { .. }
        | GatewayError::RateLimitExceeded { .. }) => e,
        other => {
            GatewayError::provider_unavailable(Some(provider.to_string()), other.to_string(), false)
        }
    }
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            breakers,
            retry,
            metrics,
        }
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Dispatch `request`, streaming when `request.stream` is set
    ///
    /// # Errors
    /// `UnsupportedModel`, `ProviderUnavailable`, `UpstreamProtocol`, or the
    /// context's cancellation/deadline error
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> GatewayResult<DispatchOutcome> {
        if request.stream {
            self.open_stream(ctx, request)
                .await
                .map(DispatchOutcome::Stream)
        } else {
            self.complete(ctx, request)
                .await
                .map(DispatchOutcome::Complete)
        }
    }

    /// Unary completion
    ///
    /// # Errors
    /// See [`Dispatcher::dispatch`]
    pub async fn complete(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> GatewayResult<Dispatched<ChatResponse>> {
        let request_id = ctx.request_id();
        self.guarded(ctx, request, move |transport| async move {
            transport.complete(request_id, request).await
        })
        .await
    }

    /// Open a stream. Retry and breaker cover setup only; chunk errors after
    /// this returns end the stream.
    ///
    /// # Errors
    /// See [`Dispatcher::dispatch`]
    pub async fn open_stream(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> GatewayResult<Dispatched<ChunkStream>> {
        let request_id = ctx.request_id();
        self.guarded(ctx, request, move |transport| async move {
            transport.stream(request_id, request).await
        })
        .await
    }

    async fn guarded<T, F, Fut>(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
        call: F,
    ) -> GatewayResult<Dispatched<T>>
    where
        F: Fn(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let resolved = self.registry.resolve(&request.model)?;
        let provider = resolved.config.name.clone();
        let breaker = self.breakers.get_or_create(&provider);

        debug!(
            request_id = %ctx.request_id(),
            provider = %provider,
            model = %request.model,
            transport = %resolved.config.transport_kind,
            "Dispatching request"
        );

        if let Err(e) = breaker.check() {
            self.metrics
                .record_upstream(&provider, "circuit_open", std::time::Duration::ZERO);
            warn!(provider = %provider, "Circuit open, rejecting call");
            return Err(final_error(&provider, e));
        }

        let transport = &resolved.transport;
        let breaker = breaker.as_ref();
        let metrics = &self.metrics;
        let provider_name = provider.as_str();
        let call = &call;

        let result = self
            .retry
            .execute(ctx, move || async move {
                let started = Instant::now();
                let result = breaker
                    .execute(|| ctx.run(call(Arc::clone(transport))))
                    .await;
                metrics.record_upstream(provider_name, attempt_outcome(&result), started.elapsed());
                result
            })
            .await;

        match result {
            Ok(value) => {
                info!(
                    request_id = %ctx.request_id(),
                    provider = %provider,
                    "Upstream call succeeded"
                );
                Ok(Dispatched { provider, value })
            }
            Err(e) => {
                if e.is_cancellation() {
                    debug!(request_id = %ctx.request_id(), provider = %provider, "Call cancelled");
                } else {
                    error!(
                        request_id = %ctx.request_id(),
                        provider = %provider,
                        error = %e,
                        "Upstream call failed"
                    );
                }
                Err(final_error(&provider, e))
            }
        }
    }
}
