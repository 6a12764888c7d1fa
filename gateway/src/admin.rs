//! The four admin operations, per spec.md §4.9 "Admin surface", wired over
//! §4.3's `AuditStore` operations. Authorization is explicitly out of scope
//! per spec.md §1 ("any administrative UI"; "out of scope how" in §4.9) —
//! `require_admin_auth` is the injectable seam where a real implementation
//! would plug in, grounded on the teacher's `SecurityCtxExtractor` + guard
//! layering (`common/security/src/context.rs`, `guards.rs`) without pulling
//! in tenant/JWT semantics that don't apply to this gateway.

use crate::app_state::AppState;
use crate::audit::AuditFilter;
use axum::{
    extract::{Path, Query, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use gateway_http_errors::ApiError;
use serde::Deserialize;

/// Bearer-token gate in front of every `/admin/*` route. Real deployments
/// are expected to front this with their own operator-authorization layer
/// (SSO, mTLS, an internal gateway); this is the minimal seam so the admin
/// routes are never wide open by default. Disabled (permissive) only when
/// no token is configured, which is flagged loudly at startup.
pub async fn require_admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => ApiError::NotFound { request_id: None }.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub caller_fingerprint: Option<String>,
    pub is_blocked: Option<bool>,
    pub response_status: Option<i32>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// `GET /admin/audit-logs` — query operation, per spec.md §4.3 `query`.
pub async fn list_audit_logs(State(state): State<AppState>, Query(q): Query<AuditLogQuery>) -> Response {
    let filter = AuditFilter {
        since: q.since,
        until: q.until,
        caller_fingerprint: q.caller_fingerprint,
        is_blocked: q.is_blocked,
        response_status: q.response_status,
        limit: q.limit.unwrap_or(100),
        offset: q.offset.unwrap_or(0),
    };

    match state.audit_store.query(filter).await {
        Ok(rows) => Json(serde_json::json!({ "entries": rows.len(), "rows": rows })).into_response(),
        Err(err) => ApiError::Internal { request_id: None, message: err.to_string() }.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditStatsQuery {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// `GET /admin/audit-stats` — stats operation, per spec.md §4.3 `statsOver`.
pub async fn audit_stats(State(state): State<AppState>, Query(q): Query<AuditStatsQuery>) -> Response {
    match state.audit_store.stats_over(q.since, q.until).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => ApiError::Internal { request_id: None, message: err.to_string() }.into_response(),
    }
}

/// `DELETE /admin/audit-logs/client/:fingerprint` — erasure operation, per
/// spec.md §4.3 `eraseByCaller` / §8 scenario 5.
pub async fn erase_by_caller(State(state): State<AppState>, Path(fingerprint): Path<String>) -> Response {
    match state.audit_store.erase_by_caller(&fingerprint).await {
        Ok(deleted) => Json(serde_json::json!({
            "deleted_count": deleted,
            "client_ip_hash": fingerprint,
        }))
        .into_response(),
        Err(err) => ApiError::Internal { request_id: None, message: err.to_string() }.into_response(),
    }
}

/// `POST /admin/audit-logs/cleanup` — retention sweep, per spec.md §4.3
/// `sweepExpired` / §8 scenario 6. Intended to be invoked by an external
/// scheduler; the gateway runs no cron of its own.
pub async fn cleanup_expired(State(state): State<AppState>) -> Response {
    match state.audit_store.sweep_expired().await {
        Ok(deleted) => Json(serde_json::json!({ "deleted_count": deleted })).into_response(),
        Err(err) => ApiError::Internal { request_id: None, message: err.to_string() }.into_response(),
    }
}
