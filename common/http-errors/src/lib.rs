use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

/// Closed enumeration of user-visible error `type`s. Every `ApiError` variant maps
/// to exactly one of these; nothing else may appear in a response body's
/// `error.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    ValidationError,
    RateLimitExceeded,
    ContentPolicyViolation,
    ServiceUnavailableError,
    NotImplementedError,
    NotFoundError,
    InternalServerError,
}

impl ErrorType {
    fn as_str(self) -> &'static str {
        match self {
            ErrorType::ValidationError => "ValidationError",
            ErrorType::RateLimitExceeded => "RateLimitExceeded",
            ErrorType::ContentPolicyViolation => "ContentPolicyViolation",
            ErrorType::ServiceUnavailableError => "ServiceUnavailableError",
            ErrorType::NotImplementedError => "NotImplementedError",
            ErrorType::NotFoundError => "NotFoundError",
            ErrorType::InternalServerError => "InternalServerError",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorType::ValidationError => StatusCode::BAD_REQUEST,
            ErrorType::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::ContentPolicyViolation => StatusCode::FORBIDDEN,
            ErrorType::ServiceUnavailableError => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::NotImplementedError => StatusCode::NOT_IMPLEMENTED,
            ErrorType::NotFoundError => StatusCode::NOT_FOUND,
            ErrorType::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize, Debug)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize, Debug)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: &'static str,
    message: String,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "retryAfter")]
    retry_after: Option<i64>,
}

/// The gateway's uniform error type. Each variant corresponds to one row of
/// the §7 error table and carries exactly what that row needs to render.
#[derive(Debug)]
pub enum ApiError {
    Validation {
        request_id: Option<String>,
        message: String,
        details: Option<serde_json::Value>,
    },
    RateLimited {
        request_id: Option<String>,
        retry_after_secs: i64,
    },
    ContentPolicy {
        request_id: Option<String>,
        issues: serde_json::Value,
        redacted_preview: String,
    },
    ServiceUnavailable {
        request_id: Option<String>,
        message: String,
    },
    NotImplemented {
        request_id: Option<String>,
        message: String,
    },
    NotFound {
        request_id: Option<String>,
    },
    Internal {
        request_id: Option<String>,
        message: String,
    },
}

impl ApiError {
    fn error_type(&self) -> ErrorType {
        match self {
            ApiError::Validation { .. } => ErrorType::ValidationError,
            ApiError::RateLimited { .. } => ErrorType::RateLimitExceeded,
            ApiError::ContentPolicy { .. } => ErrorType::ContentPolicyViolation,
            ApiError::ServiceUnavailable { .. } => ErrorType::ServiceUnavailableError,
            ApiError::NotImplemented { .. } => ErrorType::NotImplementedError,
            ApiError::NotFound { .. } => ErrorType::NotFoundError,
            ApiError::Internal { .. } => ErrorType::InternalServerError,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ApiError::Validation { request_id, .. }
            | ApiError::RateLimited { request_id, .. }
            | ApiError::ContentPolicy { request_id, .. }
            | ApiError::ServiceUnavailable { request_id, .. }
            | ApiError::NotImplemented { request_id, .. }
            | ApiError::NotFound { request_id }
            | ApiError::Internal { request_id, .. } => request_id.as_deref(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = self.error_type();
        let request_id = self.request_id().map(str::to_string);
        let (message, details, retry_after) = match self {
            ApiError::Validation { message, details, .. } => (message, details, None),
            ApiError::RateLimited { retry_after_secs, .. } => (
                "rate limit exceeded".to_string(),
                None,
                Some(retry_after_secs),
            ),
            ApiError::ContentPolicy {
                issues,
                redacted_preview,
                ..
            } => (
                "content policy violation".to_string(),
                Some(serde_json::json!({
                    "detected_issues": issues,
                    "redacted_preview": redacted_preview,
                })),
                None,
            ),
            ApiError::ServiceUnavailable { message, .. } => (message, None, None),
            ApiError::NotImplemented { message, .. } => (message, None, None),
            ApiError::NotFound { .. } => ("resource not found".to_string(), None, None),
            ApiError::Internal { message, .. } => (message, None, None),
        };

        let status = error_type.status();
        let body = ErrorEnvelope {
            error: ErrorBody {
                error_type: error_type.as_str(),
                message,
                request_id,
                timestamp: Utc::now(),
                details,
                retry_after,
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_type.as_str()) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(secs) = retry_after {
            if let Ok(val) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert("Retry-After", val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// --- Error response metrics, with a cardinality guard on the error-code label. ---
// A misbehaving caller (or a bug) that generates unbounded distinct codes must
// not be allowed to blow up Prometheus label cardinality; past MAX_ERROR_CODES
// distinct values seen, further codes are folded into "overflow".
const MAX_ERROR_CODES: usize = 40;

static ERROR_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Named distinctly from any per-service "requests by status" counter
// (e.g. `firewall_requests_by_status_total`) a consuming service may keep in
// its own registry — this one is ambient/shared across services and only
// ever counts error responses (status >= 400), so the two never collide when
// both registries are gathered into one `/metrics` response.
static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new(
            "http_error_responses_total",
            "Count of 4xx/5xx HTTP responses emitted, labeled by status and path",
        ),
        &["status", "path"],
    )
    .expect("metric definition is valid");
    ERROR_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

static ERROR_CODE_OVERFLOW: Lazy<IntCounterVec> = Lazy::new(|| {
    let v = IntCounterVec::new(
        Opts::new(
            "firewall_error_code_overflow_total",
            "Error responses whose code exceeded the label cardinality guard",
        ),
        &["service"],
    )
    .expect("metric definition is valid");
    ERROR_REGISTRY.register(Box::new(v.clone())).ok();
    v
});

static ERROR_CODE_DISTINCT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "firewall_error_code_distinct",
        "Distinct error codes observed since process start, capped at the guard",
    )
    .expect("metric definition is valid");
    ERROR_REGISTRY.register(Box::new(g.clone())).ok();
    g
});

static SEEN_ERROR_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn record_error_code(service: &str, code: &str) {
    let mut seen = SEEN_ERROR_CODES.lock().expect("error-code set lock poisoned");
    if seen.contains(code) {
        return;
    }
    if seen.len() >= MAX_ERROR_CODES {
        ERROR_CODE_OVERFLOW.with_label_values(&[service]).inc();
        return;
    }
    seen.insert(code.to_string());
    ERROR_CODE_DISTINCT.set(seen.len() as i64);
}

/// Axum middleware that records every response's status and error code (if any)
/// against the shared registry, labeled by `service`. Mount once per service
/// with `middleware::from_fn(http_error_metrics_layer("gateway"))`.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>>
       + Clone {
    move |req: Request, next: Next| {
        let path = req.uri().path().to_string();
        Box::pin(async move {
            let resp = next.run(req).await;
            let status = resp.status();
            if status.as_u16() >= 400 {
                HTTP_ERRORS_TOTAL
                    .with_label_values(&[status.as_str(), &path])
                    .inc();
                let code = resp
                    .headers()
                    .get("X-Error-Code")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                record_error_code(service, code);
            }
            resp
        })
    }
}

pub fn error_metrics_registry() -> &'static Registry {
    &ERROR_REGISTRY
}

/// Internal helpers exposed only for the overflow-guard test below.
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error_code("test-svc", code);
    }

    pub fn distinct_gauge() -> i64 {
        ERROR_CODE_DISTINCT.get()
    }

    pub fn overflow_count() -> u64 {
        ERROR_CODE_OVERFLOW.with_label_values(&["test-svc"]).get()
    }
}
