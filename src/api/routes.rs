//! API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Tracing layer with request timing
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/sse/global", get(handlers::global_stream))
        .route("/api/sse/tunnel/{instance_id}", get(handlers::tunnel_stream))
        .route("/api/tunnels", get(handlers::list_tunnels))
        .route("/api/agents/{agent_id}/connect", post(handlers::connect_agent))
        .route(
            "/api/agents/{agent_id}/disconnect",
            post(handlers::disconnect_agent),
        )
        .route("/api/agents/{agent_id}/events", get(handlers::agent_events))
        .route("/api/agents/{agent_id}/logs", get(handlers::agent_logs))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
