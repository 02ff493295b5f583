//! HTTP request handlers for the gateway API.

use async_stream::stream;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use gateway_core::{
    ApiFlavor, ChatChunk, ChatRequest, ChunkStream, CompletionChunk, CompletionRequest,
    CompletionResponse, ModelsResponse, RequestCredentials,
};
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, instrument};

use crate::{
    error::ApiError,
    extractors::{ClientCredentials, JsonBody, RequestId},
    pipeline::{self, PipelineOutcome},
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: &'static str,
    /// Version
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`
    pub status: &'static str,
    /// Registered providers
    pub providers: usize,
    /// Whether any provider passed its last probe
    pub healthy: bool,
}

/// Readiness check endpoint.
///
/// Ready once a provider is registered; resolution falls back to unhealthy
/// providers, so health only shows in the body.
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry();
    let providers = registry.len();
    let body = ReadinessResponse {
        status: if providers > 0 { "ready" } else { "not_ready" },
        providers,
        healthy: registry.has_healthy(),
    };
    let status = if providers > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state
        .metrics
        .render()
        .map_err(|e| ApiError::internal(format!("failed to render metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

/// List models endpoint (OpenAI compatible)
#[instrument(skip(state))]
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(state.registry().models())
}

/// `POST /v1/chat/completions`
#[instrument(skip(state, credentials, body), fields(model = %body.model, stream = body.stream))]
pub async fn chat_completions(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    ClientCredentials(credentials): ClientCredentials,
    JsonBody(body): JsonBody<ChatRequest>,
) -> Result<Response, ApiError> {
    respond(&state, ApiFlavor::Chat, request_id, &credentials, body).await
}

/// `POST /v1/completions`
#[instrument(skip(state, credentials, body), fields(model = %body.model, stream = body.stream))]
pub async fn completions(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    ClientCredentials(credentials): ClientCredentials,
    JsonBody(body): JsonBody<CompletionRequest>,
) -> Result<Response, ApiError> {
    respond(
        &state,
        ApiFlavor::Completion,
        request_id,
        &credentials,
        body.into_chat(),
    )
    .await
}

async fn respond(
    state: &AppState,
    flavor: ApiFlavor,
    request_id: String,
    credentials: &RequestCredentials,
    request: ChatRequest,
) -> Result<Response, ApiError> {
    let model = request.model.clone();
    let outcome =
        pipeline::execute(state, flavor.route(), request_id, credentials, request).await?;

    match outcome {
        PipelineOutcome::Complete { provider, response } => {
            debug!(provider = %provider, tokens = response.usage.total_tokens, "Completed");
            Ok(match flavor {
                ApiFlavor::Chat => Json(response).into_response(),
                ApiFlavor::Completion => Json(CompletionResponse::from(response)).into_response(),
            })
        }
        PipelineOutcome::Stream { provider, stream } => {
            debug!(provider = %provider, "Streaming");
            Ok(sse_response(stream, flavor, model))
        }
    }
}

/// Render a relayed stream as SSE.
///
/// One `data:` event per chunk, `[DONE]` after the terminal chunk. A failure
/// sends one `{"error", "code"}` event and ends the stream without `[DONE]`.
fn sse_response(mut chunks: ChunkStream, flavor: ApiFlavor, model: String) -> Response {
    let created = chrono::Utc::now().timestamp();

    let events = stream! {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let data = match flavor {
                        ApiFlavor::Chat => serde_json::to_string(
                            &ChatChunk::from_stream_chunk(&chunk, &model, created),
                        ),
                        ApiFlavor::Completion => serde_json::to_string(
                            &CompletionChunk::from_stream_chunk(&chunk, &model, created),
                        ),
                    };
                    match data {
                        Ok(data) => {
                            yield Ok::<_, Infallible>(Event::default().data(data));
                        }
                        Err(e) => {
                            let body =
                                ApiError::internal(format!("failed to encode chunk: {e}")).body();
                            yield Ok(Event::default().data(error_data(&body)));
                            return;
                        }
                    }
                    if chunk.is_final {
                        yield Ok(Event::default().data("[DONE]"));
                        return;
                    }
                }
                Err(e) => {
                    let body = ApiError::from(e).body();
                    yield Ok(Event::default().data(error_data(&body)));
                    return;
                }
            }
        }
    };

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn error_data(body: &crate::error::ErrorBody) -> String {
    serde_json::to_string(body).unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string())
}
