use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::config::ServerConfig;
use crate::handlers;
use crate::state::AppState;

pub const RESPONSES_PATH: &str = "/v1/responses";

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n")
}

pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route(
            RESPONSES_PATH,
            post(handlers::responses::responses_handler).fallback(method_not_allowed),
        )
        // Everything else goes to upstream untouched
        .fallback(handlers::passthrough::passthrough_handler)
        .with_state(state)
        .layer(CatchPanicLayer::new())
        // Tracing
        .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default()))
        .layer(DefaultBodyLimit::max(server.body_limit_bytes))
}
