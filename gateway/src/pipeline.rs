//! The admission pipeline, per spec.md §4.7 "Request lifecycle" and §4.8
//! "Admission pipeline (ordering and errors)". One handler, strictly
//! sequential, mirroring the teacher's `auth_middleware` shape (resolve
//! identity -> rate-limit check -> header emission -> short-circuit) but
//! generalized to the full six-step sequence: rate-limit, body validation,
//! analyzer call, forward (placeholder), and an always-reached audit stage.

use crate::analyzer::AnalyzerError;
use crate::app_state::AppState;
use crate::audit::{AuditEntry, BlockReason};
use crate::lifecycle::{RequestContext, RequestMeta};
use axum::{
    extract::{ConnectInfo, Extension, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

const REDACTED_PREVIEW_CHARS: usize = 100;

fn caller_ip(connect_info: Option<&ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    connect_info.map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

/// `POST /v1/chat/completions` — the gateway's only admission-pipeline
/// route. Implements spec.md §4.7 steps 2-6 in order; step 1 (request-id
/// assignment, start-time stamp) already ran in `on_request_middleware`.
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let connect_info = connect_info.map(|Extension(ci)| ci);
    let ip = caller_ip(connect_info.as_ref(), &headers);
    let api_key = header_str(&headers, "X-API-Key").map(str::to_string);
    let user_agent = header_str(&headers, "User-Agent").map(str::to_string);

    let caller_fingerprint = state.digest(ip.as_deref());
    let key_fingerprint = state.digest(api_key.as_deref());
    let user_agent_fingerprint = state.digest(user_agent.as_deref());

    let mut ctx = RequestContext::new(meta, caller_fingerprint.clone(), key_fingerprint.clone(), user_agent_fingerprint);

    let caller_identity = caller_fingerprint.as_deref().unwrap_or("anonymous");
    let key_identity = key_fingerprint.as_deref();

    // --- Step 2: rate limit ---
    let decision = if state.config.features.rate_limiting {
        state.rate_limiter.check(caller_identity, key_identity).await
    } else {
        crate::rate_limit::RateDecision::disabled()
    };
    let mut response_headers = HeaderMap::new();
    if let Some(limit) = decision.limit {
        insert_header(&mut response_headers, "X-RateLimit-Limit", limit.to_string());
    }
    if let Some(remaining) = decision.remaining {
        insert_header(&mut response_headers, "X-RateLimit-Remaining", remaining.to_string());
    }
    if let Some(reset) = decision.reset_epoch {
        insert_header(&mut response_headers, "X-RateLimit-Reset", reset.to_string());
    }

    if !decision.allowed {
        let retry_after = decision.retry_after_secs.unwrap_or(0);
        if let Some(tier) = decision.tier {
            state.metrics.record_rate_limit_violation(&tier.to_string());
        }
        ctx.patch.is_blocked = true;
        ctx.patch.block_reason = Some(BlockReason::RateLimit);
        let err = ApiError::RateLimited { request_id: Some(ctx.request_id.clone()), retry_after_secs: retry_after };
        let mut resp = err.into_response();
        merge_headers(resp.headers_mut(), &response_headers);
        return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
    }

    // --- Step 3: body validation ---
    let parsed: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            let resp = validation_error(&ctx, format!("malformed request body: {err}"), None);
            let mut resp = resp.into_response();
            merge_headers(resp.headers_mut(), &response_headers);
            return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
        }
    };

    if parsed.messages.is_empty() {
        let resp = validation_error(&ctx, "messages array must not be empty".into(), None);
        let mut resp = resp.into_response();
        merge_headers(resp.headers_mut(), &response_headers);
        return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
    }

    let content_length: usize = parsed.messages.iter().map(|m| m.content.len()).sum();
    let security = &state.config.security;
    if content_length < security.min_content_length || content_length > security.max_content_length {
        let resp = validation_error(
            &ctx,
            format!(
                "content length {content_length} outside [{}, {}]",
                security.min_content_length, security.max_content_length
            ),
            None,
        );
        let mut resp = resp.into_response();
        merge_headers(resp.headers_mut(), &response_headers);
        return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
    }

    // --- Step 4: analyzer call ---
    let content = parsed
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut analyzer_metadata = std::collections::HashMap::new();
    if let Some(ip) = ip.as_deref() {
        analyzer_metadata.insert("client_ip".to_string(), ip.to_string());
    }
    if let Some(ua) = user_agent.as_deref() {
        analyzer_metadata.insert("user_agent".to_string(), ua.to_string());
    }
    if let Some(model) = parsed.model.as_deref() {
        analyzer_metadata.insert("model".to_string(), model.to_string());
    }

    match state.analyzer.check_content(&content, &ctx.request_id, analyzer_metadata).await {
        Ok(verdict) => {
            ctx.patch.llm_provider = Some("openai-compatible".to_string());
            ctx.patch.llm_model = parsed.model.clone();

            if !verdict.is_safe {
                for issue in &verdict.issues {
                    state.metrics.record_pii_detection(issue.kind.as_str());
                    if matches!(
                        issue.kind,
                        crate::analyzer::IssueKind::PromptInjection | crate::analyzer::IssueKind::Jailbreak
                    ) {
                        state.metrics.record_prompt_injection(issue.kind.as_str());
                    }
                }
                state.metrics.record_blocked(BlockReason::ContentPolicyViolation.as_str(), "/v1/chat/completions");

                ctx.patch.is_blocked = true;
                ctx.patch.block_reason = Some(BlockReason::ContentPolicyViolation);
                ctx.patch.detected_issues_count = verdict.issues.len() as i32;
                ctx.patch.security_confidence = Some(verdict.confidence);

                let preview = verdict
                    .redacted_preview
                    .unwrap_or_else(|| content.chars().take(REDACTED_PREVIEW_CHARS).collect());
                let preview: String = preview.chars().take(REDACTED_PREVIEW_CHARS).collect();

                let issues_json = serde_json::json!(verdict
                    .issues
                    .iter()
                    .map(|i| serde_json::json!({
                        "type": i.kind.as_str(),
                        "start": i.start,
                        "end": i.end,
                        "confidence": i.confidence,
                    }))
                    .collect::<Vec<_>>());

                let err = ApiError::ContentPolicy {
                    request_id: Some(ctx.request_id.clone()),
                    issues: issues_json,
                    redacted_preview: preview,
                };
                let mut resp = err.into_response();
                merge_headers(resp.headers_mut(), &response_headers);
                return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
            }

            ctx.patch.detected_issues_count = 0;
            ctx.patch.security_confidence = Some(verdict.confidence);
        }
        Err(AnalyzerError::InvalidArgument(msg)) => {
            let resp = validation_error(&ctx, format!("analyzer rejected request: {msg}"), None);
            let mut resp = resp.into_response();
            merge_headers(resp.headers_mut(), &response_headers);
            return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
        }
        Err(AnalyzerError::Unavailable(msg)) => {
            warn!(request_id = %ctx.request_id, error = %msg, "analyzer unreachable after retries");
            let err = ApiError::ServiceUnavailable {
                request_id: Some(ctx.request_id.clone()),
                message: "content analyzer unavailable".to_string(),
            };
            let mut resp = err.into_response();
            merge_headers(resp.headers_mut(), &response_headers);
            return finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await;
        }
    }

    // --- Step 5: forward (out of scope; placeholder until an LLM client is wired) ---
    let err = ApiError::NotImplemented {
        request_id: Some(ctx.request_id.clone()),
        message: "forwarding to the upstream provider is not wired yet".to_string(),
    };
    let mut resp = err.into_response();
    merge_headers(resp.headers_mut(), &response_headers);
    finish(&state, &ctx, "POST", "/v1/chat/completions", body.len(), resp).await
}

fn validation_error(ctx: &RequestContext, message: String, details: Option<serde_json::Value>) -> ApiError {
    ApiError::Validation { request_id: Some(ctx.request_id.clone()), message, details }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(val) = HeaderValue::from_str(&value) {
        headers.insert(name, val);
    }
}

fn merge_headers(into: &mut HeaderMap, from: &HeaderMap) {
    for (name, value) in from.iter() {
        into.insert(name.clone(), value.clone());
    }
}

/// Every response this handler builds is a small `Json`-encoded error body;
/// this bounds how much of it `finish` will buffer to measure its real size.
const MAX_AUDITED_BODY_BYTES: usize = 1024 * 1024;

/// Step 6: OnResponse hook. Computes latency, assembles the audit entry from
/// the patch plus request/response metadata, and enqueues it — never
/// delaying or failing the response itself (spec.md §4.6 "best-effort").
///
/// Takes `response` by value and returns it rebuilt from its own bytes:
/// `axum::Json::into_response()` never sets `Content-Length` (hyper computes
/// it later, at wire-encoding time), so the only way to know the real
/// response-byte-count for the audit row is to buffer the body here.
async fn finish(state: &AppState, ctx: &RequestContext, method: &str, path: &str, request_bytes: usize, response: Response) -> Response {
    let latency_ms = ctx.elapsed_ms();
    state.metrics.observe_latency(path, method, latency_ms as f64 / 1000.0);

    let (parts, body) = response.into_parts();
    let status = parts.status.as_u16();
    let body_bytes = axum::body::to_bytes(body, MAX_AUDITED_BODY_BYTES).await.unwrap_or_default();
    let response_bytes = body_bytes.len() as i64;
    let response = Response::from_parts(parts, axum::body::Body::from(body_bytes));

    state.metrics.record_request(path, method, status);

    info!(
        request_id = %ctx.request_id,
        status,
        latency_ms,
        is_blocked = ctx.patch.is_blocked,
        "admission pipeline decision"
    );

    if state.config.features.audit_logging {
        let now = chrono::Utc::now();
        let entry = AuditEntry {
            id: None,
            request_id: ctx.request_id.clone(),
            timestamp: now,
            method: method.to_string(),
            path: path.to_string(),
            caller_fingerprint: ctx.caller_fingerprint.clone(),
            user_agent_fingerprint: ctx.user_agent_fingerprint.clone(),
            key_fingerprint: ctx.key_fingerprint.clone(),
            request_bytes: request_bytes as i64,
            response_status: status as i32,
            response_bytes,
            latency_ms,
            is_blocked: ctx.patch.is_blocked,
            block_reason: ctx.patch.block_reason,
            detected_issues_count: ctx.patch.detected_issues_count,
            security_confidence: ctx.patch.security_confidence,
            llm_provider: ctx.patch.llm_provider.clone(),
            llm_model: ctx.patch.llm_model.clone(),
            metadata: serde_json::Value::Object(ctx.patch.metadata.clone()),
            retention_until: AuditEntry::retention_until_from(now, state.config.audit.retention_days),
        };
        state.audit_queue.enqueue(entry).await;
        state.metrics.set_audit_queue_size(state.audit_queue.size());
    }

    response
}

/// `GET /v1/models` — static listing of configured model identifiers.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": state.config.models.iter().map(|id| serde_json::json!({
            "id": id,
            "object": "model",
        })).collect::<Vec<_>>(),
    }))
}

/// `GET /health` — liveness probe. Never audited, never rate-limited.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "llm-security-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now(),
        "uptime": state.uptime_seconds(),
    }))
}

/// `GET /ready` — fans out to all three dependencies; 200 only if every one
/// reports healthy. Never rate-limited.
pub async fn ready(State(state): State<AppState>) -> Response {
    let analyzer_ok = matches!(
        state.analyzer.health_check().await,
        Ok(status) if status.serving == crate::analyzer::ServingStatus::Serving
    );
    let audit_ok = state.audit_store.health_check().await.is_ok();
    let rate_limit_ok = state.rate_limiter.health_check().await.is_ok();

    let all_ok = analyzer_ok && audit_ok && rate_limit_ok;
    let body = serde_json::json!({
        "analyzer": analyzer_ok,
        "audit_store": audit_ok,
        "rate_limit_store": rate_limit_ok,
    });
    let status = if all_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}
