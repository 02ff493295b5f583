//! Admin API: provider registry and circuit breakers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use gateway_core::ProviderConfig;
use gateway_resilience::CircuitBreakerStatus;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::{error::ApiError, extractors::JsonBody, state::AppState};

/// `GET /v1/providers`
#[instrument(skip(state))]
pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderConfig>> {
    Json(state.registry().snapshot())
}

/// `POST /v1/providers`
#[instrument(skip(state, config), fields(provider = %config.name))]
pub async fn register_provider(
    State(state): State<AppState>,
    JsonBody(config): JsonBody<ProviderConfig>,
) -> Result<impl IntoResponse, ApiError> {
    let name = config.name.clone();
    state.registry().register(config)?;
    info!(provider = %name, "Provider registered");

    let registered = state
        .registry()
        .get(&name)
        .ok_or_else(|| ApiError::internal("provider vanished after registration"))?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// `DELETE /v1/providers/{name}`
#[instrument(skip(state))]
pub async fn deregister_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProviderConfig>, ApiError> {
    let removed = state.registry().deregister(&name)?;
    state.breakers().remove(&name);
    state.metrics.forget_provider(&name);
    info!(provider = %name, "Provider deregistered");
    Ok(Json(removed))
}

/// `GET /v1/circuit-breakers`
#[instrument(skip(state))]
pub async fn list_circuit_breakers(
    State(state): State<AppState>,
) -> Json<Vec<CircuitBreakerStatus>> {
    Json(state.breakers().statuses())
}

/// Breaker for a provider, created on demand for registered providers that
/// have not been called yet
fn breaker_for(
    state: &AppState,
    name: &str,
) -> Result<Arc<gateway_resilience::CircuitBreaker>, ApiError> {
    if let Some(breaker) = state.breakers().get(name) {
        return Ok(breaker);
    }
    if state.registry().get(name).is_some() {
        return Ok(state.breakers().get_or_create(name));
    }
    Err(ApiError::not_found(format!("circuit breaker not found: {name}")))
}

/// `GET /v1/circuit-breakers/{name}`
#[instrument(skip(state))]
pub async fn get_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerStatus>, ApiError> {
    Ok(Json(breaker_for(&state, &name)?.status()))
}

/// `POST /v1/circuit-breakers/{name}/reset`
#[instrument(skip(state))]
pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CircuitBreakerStatus>, ApiError> {
    let breaker = breaker_for(&state, &name)?;
    breaker.reset();
    info!(provider = %name, "Circuit breaker reset");
    Ok(Json(breaker.status()))
}
