//! Router-level exercises of the `/admin/*` surface, same style as
//! `admission_pipeline.rs`: build a real `AppState` over in-memory fakes and
//! drive it through `tower::ServiceExt::oneshot` rather than unit-testing
//! `admin.rs`'s handlers directly.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use chrono::{Duration, Utc};
use llm_security_gateway::analyzer::fakes::AlwaysUnavailableAnalyzer;
use llm_security_gateway::app_state::AppState;
use llm_security_gateway::audit::model::{AuditEntry, BlockReason};
use llm_security_gateway::audit::{AuditQueue, AuditStore, InMemoryAuditStore};
use llm_security_gateway::config::{
    AnalyzerConfig, AuditConfig, FeatureFlags, GatewayConfig, RateLimitConfig, SecurityConfig, TierConfig,
};
use llm_security_gateway::metrics::GatewayMetrics;
use llm_security_gateway::rate_limit::store::InMemoryStore;
use llm_security_gateway::rate_limit::RateLimiter;
use std::sync::Arc;
use tower::ServiceExt;

fn generous_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        global: TierConfig { max: 10_000, window_secs: 60 },
        per_caller: TierConfig { max: 10_000, window_secs: 60 },
        per_key: TierConfig { max: 10_000, window_secs: 60 },
    }
}

fn test_config(admin_token: Option<String>) -> GatewayConfig {
    GatewayConfig {
        bind_host: "127.0.0.1".into(),
        bind_port: 0,
        redis_url: "redis://unused".into(),
        redis_prefix: "rate_limit".into(),
        rate_limit: generous_rate_limit(),
        analyzer: AnalyzerConfig { host: "localhost".into(), port: 50051, timeout_secs: 5, max_retries: 3 },
        audit: AuditConfig {
            database_url: "postgres://unused".into(),
            async_mode: false,
            retention_days: 90,
            queue_capacity: 1000,
        },
        security: SecurityConfig { min_content_length: 1, max_content_length: 10_240 },
        features: FeatureFlags { audit_logging: true, rate_limiting: true },
        digest_salt: "test-salt".into(),
        models: vec!["gpt-4".into()],
        shutdown_ceiling_secs: 10,
        admin_token,
    }
}

fn build_state(admin_token: Option<String>, audit_store: Arc<InMemoryAuditStore>) -> AppState {
    let config = Arc::new(test_config(admin_token));
    let rate_limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryStore::new()), "rate_limit", generous_rate_limit()));
    let analyzer = Arc::new(AlwaysUnavailableAnalyzer::default());
    let audit_queue = AuditQueue::synchronous(audit_store.clone());
    let metrics = Arc::new(GatewayMetrics::new().expect("metric definitions are valid"));
    let digest_salt = gateway_digest::DigestSalt::new(config.digest_salt.clone().into_bytes());

    AppState {
        config,
        rate_limiter,
        analyzer,
        audit_store,
        audit_queue,
        metrics,
        digest_salt,
        started_at: std::time::Instant::now(),
    }
}

fn sample_row(caller_fingerprint: &str, blocked: bool, status: i32) -> AuditEntry {
    let now = Utc::now();
    AuditEntry {
        id: None,
        request_id: "req-1".into(),
        timestamp: now,
        method: "POST".into(),
        path: "/v1/chat/completions".into(),
        caller_fingerprint: Some(caller_fingerprint.into()),
        user_agent_fingerprint: None,
        key_fingerprint: None,
        request_bytes: 100,
        response_status: status,
        response_bytes: 50,
        latency_ms: 12,
        is_blocked: blocked,
        block_reason: if blocked { Some(BlockReason::ContentPolicyViolation) } else { None },
        detected_issues_count: if blocked { 1 } else { 0 },
        security_confidence: Some(0.9),
        llm_provider: None,
        llm_model: None,
        metadata: serde_json::json!({}),
        retention_until: now + Duration::days(90),
    }
}

#[tokio::test]
async fn admin_routes_are_open_when_no_token_is_configured() {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    let state = build_state(None, audit_store);
    let app = llm_security_gateway::build_router(state);

    let resp = app
        .oneshot(Request::builder().uri("/admin/audit-stats?since=2020-01-01T00:00:00Z&until=2030-01-01T00:00:00Z").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_routes_reject_missing_or_wrong_token_when_configured() {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    let state = build_state(Some("secret-token".into()), audit_store);
    let app = llm_security_gateway::build_router(state);

    let missing = app
        .clone()
        .oneshot(Request::builder().uri("/admin/audit-stats?since=2020-01-01T00:00:00Z&until=2030-01-01T00:00:00Z").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let wrong = app
        .oneshot(
            Request::builder()
                .uri("/admin/audit-stats?since=2020-01-01T00:00:00Z&until=2030-01-01T00:00:00Z")
                .header(header::AUTHORIZATION, "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn admin_routes_accept_the_configured_bearer_token() {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    audit_store.insert(sample_row("caller-a", true, 403)).await.unwrap();
    let state = build_state(Some("secret-token".into()), audit_store);
    let app = llm_security_gateway::build_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/admin/audit-logs")
                .header(header::AUTHORIZATION, "Bearer secret-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), 8192).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["entries"], 1);
}

#[tokio::test]
async fn erase_by_caller_deletes_only_matching_rows() {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    audit_store.insert(sample_row("caller-a", true, 403)).await.unwrap();
    audit_store.insert(sample_row("caller-b", false, 501)).await.unwrap();
    let state = build_state(None, audit_store.clone());
    let app = llm_security_gateway::build_router(state);

    let resp = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/admin/audit-logs/client/caller-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let remaining = audit_store.all().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].caller_fingerprint.as_deref(), Some("caller-b"));
}

#[tokio::test]
async fn cleanup_expired_sweeps_only_rows_past_retention() {
    let audit_store = Arc::new(InMemoryAuditStore::new());
    let mut expired = sample_row("caller-a", false, 200);
    expired.retention_until = Utc::now() - Duration::days(1);
    audit_store.insert(expired).await.unwrap();
    audit_store.insert(sample_row("caller-b", false, 200)).await.unwrap();
    let state = build_state(None, audit_store.clone());
    let app = llm_security_gateway::build_router(state);

    let resp = app
        .oneshot(Request::builder().method("POST").uri("/admin/audit-logs/cleanup").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = to_bytes(resp.into_body(), 8192).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["deleted_count"], 1);
    assert_eq!(audit_store.all().await.len(), 1);
}
