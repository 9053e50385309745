//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/resources", post(handlers::create_resource))
        .route(
            "/resources/{id}",
            get(handlers::get_resource).delete(handlers::destroy_resource),
        )
        .route("/resources/{id}/start", post(handlers::start_resource))
        .route("/resources/{id}/restart", post(handlers::restart_resource))
        .route("/resources/{id}/stop", post(handlers::stop_resource))
        .route("/resources/{id}/activity", post(handlers::touch_resource))
        .route("/resources/{id}/exec", post(handlers::exec_resource))
        .route("/resources/{id}/logs", get(handlers::resource_logs))
        .route("/resources/{id}/events", get(handlers::resource_events))
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Cross-origin access is denied unless origins are configured.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];
    let headers = [
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        header::ACCEPT,
        header::ORIGIN,
    ];

    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}
