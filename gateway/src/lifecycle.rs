//! Per-request state, per spec.md §4.7 "Request lifecycle" and §3.1
//! "Request context" / "Audit patch".
//!
//! `on_request_middleware` performs the OnRequest hook (step 1): it assigns
//! the request id, stamps the start time, and stashes both in request
//! extensions so the admission handler and the response-header write-back
//! share a single source of truth. It also applies the header contract that
//! always holds (`X-Request-Id`, `X-Response-Time`), mirroring the teacher's
//! `auth_middleware` pattern of stashing per-request identity in extensions
//! for downstream handlers to read.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use uuid::Uuid;

/// Stashed into request extensions by `on_request_middleware`; read back by
/// the admission handler and by the same middleware at response time.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub start: Instant,
}

/// Step 1 of spec.md §4.7: honor any non-empty inbound `X-Request-Id` value
/// verbatim, whatever its format — a caller-supplied id is an opaque
/// correlation token, not required to be a UUID. Only absence (or an empty
/// header) falls back to a freshly generated UUID.
pub async fn on_request_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-Id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let meta = RequestMeta { request_id: request_id.clone(), start: Instant::now() };
    request.extensions_mut().insert(meta.clone());

    let mut response = next.run(request).await;

    let elapsed_ms = meta.start.elapsed().as_millis();
    if let Ok(val) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-Id", val);
    }
    if let Ok(val) = HeaderValue::from_str(&format!("{elapsed_ms}ms")) {
        response.headers_mut().insert("X-Response-Time", val);
    }
    response
}

/// The fields the admission pipeline fills in as it progresses, per
/// spec.md §3.1 "Request context" / GLOSSARY "Audit patch". Owned
/// exclusively by the request's `RequestContext` and read only after the
/// response is flushed — never shared across requests, replacing the
/// source's pointer-aliased decoration (spec.md §9).
#[derive(Debug, Clone, Default)]
pub struct AuditPatch {
    pub is_blocked: bool,
    pub block_reason: Option<crate::audit::BlockReason>,
    pub detected_issues_count: i32,
    pub security_confidence: Option<f32>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Per-inbound-request state, per spec.md §3.1 "Request context". Lives for
/// the request's duration; destroyed after audit-enqueue.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub start: Instant,
    pub caller_fingerprint: Option<String>,
    pub key_fingerprint: Option<String>,
    pub user_agent_fingerprint: Option<String>,
    pub patch: AuditPatch,
}

impl RequestContext {
    pub fn new(
        meta: RequestMeta,
        caller_fingerprint: Option<String>,
        key_fingerprint: Option<String>,
        user_agent_fingerprint: Option<String>,
    ) -> Self {
        Self {
            request_id: meta.request_id,
            start: meta.start,
            caller_fingerprint,
            key_fingerprint,
            user_agent_fingerprint,
            patch: AuditPatch::default(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}
