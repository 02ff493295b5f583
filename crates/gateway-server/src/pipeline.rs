//! Request pipeline shared by the HTTP and gRPC surfaces.
//!
//! validate → identify → admit → dispatch → (relay) → settle + report usage

use chrono::Utc;
use gateway_core::{
    CallContext, ChatRequest, ChatResponse, ChunkStream, ClientId, GatewayResult,
    RequestCredentials, UsageEvent, UsageOutcome,
};
use gateway_ratelimit::{Admission, AdmissionController};
use gateway_routing::{relay_stream, DispatchOutcome, RelaySummary, UsageReporter};
use std::sync::Arc;
use tracing::{debug, info};

use crate::state::AppState;

/// What the caller gets back
pub enum PipelineOutcome {
    /// Unary response
    Complete {
        /// Provider that served it
        provider: String,
        /// Response
        response: ChatResponse,
    },
    /// Relayed stream ending in one terminal chunk on success
    Stream {
        /// Provider that serves it
        provider: String,
        /// Relayed chunks
        stream: ChunkStream,
    },
}

impl std::fmt::Debug for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { provider, .. } => f
                .debug_struct("Complete")
                .field("provider", provider)
                .finish_non_exhaustive(),
            Self::Stream { provider, .. } => f
                .debug_struct("Stream")
                .field("provider", provider)
                .finish_non_exhaustive(),
        }
    }
}

/// Accounting for one admitted call
struct Ledger {
    admission: Arc<AdmissionController>,
    usage: UsageReporter,
    client: ClientId,
    route: &'static str,
    model: String,
    estimated_tokens: u32,
}

impl Ledger {
    /// Settle the token bucket in the background and queue a usage event
    fn close(self, request_id: String, provider: String, tokens_used: u32, outcome: UsageOutcome) {
        let Self {
            admission,
            usage,
            client,
            route,
            model,
            estimated_tokens,
        } = self;

        usage.report(UsageEvent {
            client_id: client.to_string(),
            model,
            provider,
            tokens_used,
            request_id,
            outcome,
            recorded_at: Utc::now(),
        });

        // The stream guard may finish outside a runtime during teardown
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                admission
                    .settle(&client, route, estimated_tokens, tokens_used)
                    .await;
            });
        }
    }

    /// Return the estimate when no upstream call consumed tokens
    fn refund(self) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                self.admission
                    .settle(&self.client, self.route, self.estimated_tokens, 0)
                    .await;
            });
        }
    }
}

/// Run one completion call.
///
/// `route` keys rate rules and metrics. The call budget is the streaming
/// timeout for streamed requests and the request timeout otherwise.
///
/// # Errors
/// `Validation`, `RateLimitExceeded`, or any dispatch error
pub async fn execute(
    state: &AppState,
    route: &'static str,
    request_id: String,
    credentials: &RequestCredentials,
    request: ChatRequest,
) -> GatewayResult<PipelineOutcome> {
    request.validate()?;

    let client = state.identity.resolve(credentials);
    let estimated_tokens = request.estimated_tokens();

    let admission = state
        .admission
        .admit(&client, route, estimated_tokens)
        .await;
    let decision = match admission {
        Admission::Allowed => "allowed",
        Admission::Denied { .. } => "denied",
    };
    state.metrics.record_admission(route, decision);
    if let Admission::Denied { reason, .. } = admission {
        info!(
            request_id = %request_id,
            client = %client,
            route,
            reason = reason.as_str(),
            "Request denied"
        );
    }
    admission.into_result()?;

    let budget = if request.stream {
        state.stream_timeout
    } else {
        state.request_timeout
    };
    let ctx = CallContext::new(request_id, budget).with_parent(&state.calls);

    let ledger = Ledger {
        admission: Arc::clone(&state.admission),
        usage: state.usage.clone(),
        client,
        route,
        model: request.model.clone(),
        estimated_tokens,
    };

    debug!(
        request_id = %ctx.request_id(),
        client = %ledger.client,
        model = %request.model,
        stream = request.stream,
        estimated_tokens,
        "Dispatching"
    );

    let dispatched = match state.dispatcher.dispatch(&ctx, &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ledger.refund();
            return Err(e);
        }
    };

    match dispatched {
        DispatchOutcome::Complete(done) => {
            ledger.close(
                ctx.request_id().to_string(),
                done.provider.clone(),
                done.value.usage.total_tokens,
                UsageOutcome::Complete,
            );
            Ok(PipelineOutcome::Complete {
                provider: done.provider,
                response: done.value,
            })
        }
        DispatchOutcome::Stream(open) => {
            let provider = open.provider.clone();
            let stream = relay_stream(
                ctx,
                open.provider,
                open.value,
                Some(state.metrics.clone()),
                move |summary: RelaySummary| {
                    let outcome = if summary.outcome.is_complete() {
                        UsageOutcome::Complete
                    } else {
                        UsageOutcome::Partial
                    };
                    ledger.close(
                        summary.request_id,
                        summary.provider,
                        summary.tokens_used,
                        outcome,
                    );
                },
            );
            Ok(PipelineOutcome::Stream { provider, stream })
        }
    }
}
