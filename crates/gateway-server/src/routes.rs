//! Route definitions for the gateway API.

use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::{admin, auth, handlers, middleware, state::AppState};

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    if state.expose_metrics {
        router = router.route("/metrics", get(handlers::metrics_endpoint));
    }

    router
        // OpenAI-compatible and admin endpoints
        .nest("/v1", api_routes(state.clone()))
        // Apply middleware; the last layer runs first
        .layer(axum::middleware::from_fn(middleware::logging_middleware))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(middleware::cors_layer())
        .with_state(state)
}

fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/models", get(handlers::list_models))
        .merge(admin_routes(state))
}

/// Admin/management routes
fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/providers",
            get(admin::list_providers).post(admin::register_provider),
        )
        .route("/providers/:name", delete(admin::deregister_provider))
        .route("/circuit-breakers", get(admin::list_circuit_breakers))
        .route("/circuit-breakers/:name", get(admin::get_circuit_breaker))
        .route(
            "/circuit-breakers/:name/reset",
            post(admin::reset_circuit_breaker),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            auth::admin_auth,
        ))
}
