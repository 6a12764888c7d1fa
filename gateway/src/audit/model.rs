use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Closed enumeration of reasons a request was blocked, per spec.md §3.1
/// "Audit entry" / §4.8's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    RateLimit,
    ContentPolicyViolation,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::RateLimit => "rate-limit",
            BlockReason::ContentPolicyViolation => "content-policy-violation",
        }
    }
}

/// Append-only row, per spec.md §3.1 "Audit entry". `id` is assigned by the
/// store on insert; everything else is assembled by the request lifecycle
/// from the audit patch plus request/response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub caller_fingerprint: Option<String>,
    pub user_agent_fingerprint: Option<String>,
    pub key_fingerprint: Option<String>,
    pub request_bytes: i64,
    pub response_status: i32,
    pub response_bytes: i64,
    pub latency_ms: i64,
    pub is_blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub detected_issues_count: i32,
    pub security_confidence: Option<f32>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub metadata: serde_json::Value,
    pub retention_until: DateTime<Utc>,
}

impl AuditEntry {
    pub fn retention_until_from(created_at: DateTime<Utc>, retention_days: i64) -> DateTime<Utc> {
        created_at + Duration::days(retention_days)
    }
}

/// Filter for `AuditStore::query`, per spec.md §4.3.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub caller_fingerprint: Option<String>,
    pub is_blocked: Option<bool>,
    pub response_status: Option<i32>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditFilter {
    /// Clamps `limit` to the spec's ceiling of 1000.
    pub fn normalized(mut self) -> Self {
        if self.limit <= 0 {
            self.limit = 100;
        }
        self.limit = self.limit.min(1000);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_requests: i64,
    pub blocked_requests: i64,
    pub block_rate: f64,
    pub avg_latency_ms: f64,
    pub unique_callers: i64,
    pub counts_by_status: Vec<(i32, i64)>,
}
