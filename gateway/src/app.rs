//! Route table, per spec.md §6.1 "Inbound HTTP surface". Grounded on the
//! teacher's `app.rs`/`build_router(state)` split (e.g.
//! `order-service/src/app.rs`): router construction lives here, `main.rs`
//! only does environment setup and serving.

use crate::admin;
use crate::app_state::AppState;
use crate::lifecycle::on_request_middleware;
use crate::pipeline;
use axum::{
    http::Method,
    middleware,
    routing::{delete, get, post},
    Router,
};
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use gateway_http_errors::ApiError;
use tower_http::cors::{Any, CorsLayer};

/// Unknown-route fallback, per spec.md §4.8: "A 404 for an unknown route
/// follows the same shape" as every other admission-pipeline error body.
pub async fn not_found() -> Response {
    ApiError::NotFound { request_id: None }.into_response()
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    use axum::body::Body;
    use axum::http::StatusCode;
    use tracing::warn;

    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/admin/audit-logs", get(admin::list_audit_logs))
        .route("/admin/audit-stats", get(admin::audit_stats))
        .route("/admin/audit-logs/client/:fingerprint", delete(admin::erase_by_caller))
        .route("/admin/audit-logs/cleanup", post(admin::cleanup_expired))
        .layer(middleware::from_fn_with_state(state.clone(), admin::require_admin_auth));

    // Callers authenticate with `X-API-Key`/`X-Admin-Token`, not cookies, so a
    // permissive origin list carries no CSRF exposure; still pin the method
    // and header sets to what this surface actually serves.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    // spec.md §5: "Inbound body reads: bounded by maxContentLength + 1024
    // bytes" — without this, axum's own unrelated 2 MiB default governs how
    // much of a request body gets buffered before step 3's content-length
    // check ever runs.
    let body_limit = DefaultBodyLimit::max(state.config.security.max_content_length + 1024);

    Router::new()
        .route("/health", get(pipeline::health))
        .route("/ready", get(pipeline::ready))
        .route("/v1/chat/completions", post(pipeline::chat_completions))
        .route("/v1/models", get(pipeline::list_models))
        .route("/metrics", get(metrics_endpoint))
        .merge(admin_routes)
        .fallback(not_found)
        .layer(body_limit)
        .layer(middleware::from_fn(on_request_middleware))
        .layer(middleware::from_fn(gateway_http_errors::http_error_metrics_layer(
            "llm-security-gateway",
        )))
        .layer(cors)
        .with_state(state)
}
