use super::model::{AuditEntry, AuditFilter, AuditStats};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The four operations spec.md §4.3 names, plus `health_check` for the
/// `/ready` probe (§6.1). `PostgresAuditStore` is the production
/// implementation; `InMemoryAuditStore` backs tests that would otherwise
/// need a live Postgres.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, entry: AuditEntry) -> Result<i64>;
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>>;
    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64>;
    async fn sweep_expired(&self) -> Result<u64>;
    async fn stats_over(&self, since: chrono::DateTime<Utc>, until: chrono::DateTime<Utc>) -> Result<AuditStats>;
    async fn health_check(&self) -> Result<()>;

    /// Closes the underlying connection pool. Called once, last, during the
    /// shutdown coordinator's ordered drain (spec.md §4.10 step 4).
    async fn close(&self) {}
}

#[derive(Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .idle_timeout(Duration::from_secs(30))
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("failed to connect to audit store")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `audit_log` table and its indexes, per spec.md §6.3.
    /// Called once at startup; idempotent via `IF NOT EXISTS`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id BIGSERIAL PRIMARY KEY,
                request_id TEXT NOT NULL,
                ts TIMESTAMPTZ NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                caller_fingerprint TEXT,
                user_agent_fingerprint TEXT,
                key_fingerprint TEXT,
                request_bytes BIGINT NOT NULL,
                response_status INT NOT NULL,
                response_bytes BIGINT NOT NULL,
                latency_ms BIGINT NOT NULL,
                is_blocked BOOLEAN NOT NULL,
                block_reason TEXT,
                detected_issues_count INT NOT NULL,
                security_confidence REAL,
                llm_provider TEXT,
                llm_model TEXT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                retention_until TIMESTAMPTZ NOT NULL
            );
            CREATE INDEX IF NOT EXISTS audit_log_ts_idx ON audit_log (ts DESC);
            CREATE INDEX IF NOT EXISTS audit_log_caller_fingerprint_idx ON audit_log (caller_fingerprint);
            CREATE INDEX IF NOT EXISTS audit_log_is_blocked_idx ON audit_log (is_blocked) WHERE is_blocked;
            CREATE INDEX IF NOT EXISTS audit_log_response_status_idx ON audit_log (response_status);
            CREATE INDEX IF NOT EXISTS audit_log_retention_until_idx ON audit_log (retention_until);
            CREATE INDEX IF NOT EXISTS audit_log_key_fingerprint_idx ON audit_log (key_fingerprint) WHERE key_fingerprint IS NOT NULL;
            CREATE INDEX IF NOT EXISTS audit_log_metadata_gin_idx ON audit_log USING GIN (metadata);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to migrate audit_log table")?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn insert(&self, entry: AuditEntry) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO audit_log (
                request_id, ts, method, path, caller_fingerprint, user_agent_fingerprint,
                key_fingerprint, request_bytes, response_status, response_bytes, latency_ms,
                is_blocked, block_reason, detected_issues_count, security_confidence,
                llm_provider, llm_model, metadata, retention_until
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
            RETURNING id
            "#,
        )
        .bind(entry.request_id)
        .bind(entry.timestamp)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.caller_fingerprint)
        .bind(&entry.user_agent_fingerprint)
        .bind(&entry.key_fingerprint)
        .bind(entry.request_bytes)
        .bind(entry.response_status)
        .bind(entry.response_bytes)
        .bind(entry.latency_ms)
        .bind(entry.is_blocked)
        .bind(entry.block_reason.map(|r| r.as_str()))
        .bind(entry.detected_issues_count)
        .bind(entry.security_confidence)
        .bind(&entry.llm_provider)
        .bind(&entry.llm_model)
        .bind(&entry.metadata)
        .bind(entry.retention_until)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert audit entry")?;
        Ok(row.get("id"))
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let filter = filter.normalized();
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, ts, method, path, caller_fingerprint, user_agent_fingerprint,
                   key_fingerprint, request_bytes, response_status, response_bytes, latency_ms,
                   is_blocked, block_reason, detected_issues_count, security_confidence,
                   llm_provider, llm_model, metadata, retention_until
            FROM audit_log
            WHERE ($1::timestamptz IS NULL OR ts >= $1)
              AND ($2::timestamptz IS NULL OR ts <= $2)
              AND ($3::text IS NULL OR caller_fingerprint = $3)
              AND ($4::boolean IS NULL OR is_blocked = $4)
              AND ($5::int IS NULL OR response_status = $5)
            ORDER BY ts DESC
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.since)
        .bind(filter.until)
        .bind(&filter.caller_fingerprint)
        .bind(filter.is_blocked)
        .bind(filter.response_status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await
        .context("failed to query audit log")?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE caller_fingerprint = $1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .context("failed to erase audit rows by caller")?;
        Ok(result.rows_affected())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE retention_until < now()")
            .execute(&self.pool)
            .await
            .context("failed to sweep expired audit rows")?;
        Ok(result.rows_affected())
    }

    async fn stats_over(&self, since: chrono::DateTime<Utc>, until: chrono::DateTime<Utc>) -> Result<AuditStats> {
        // A single aggregate pass over the filtered range, not a cross-join
        // with a per-status subquery — see DESIGN.md on the source's
        // status-count cross-join, which would multiply totals by the number
        // of status buckets.
        let totals = sqlx::query(
            r#"
            SELECT
                COUNT(*)::bigint AS total_requests,
                COUNT(*) FILTER (WHERE is_blocked)::bigint AS blocked_requests,
                COALESCE(AVG(latency_ms), 0)::float8 AS avg_latency,
                COUNT(DISTINCT caller_fingerprint)::bigint AS unique_callers
            FROM audit_log
            WHERE ts >= $1 AND ts <= $2
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await
        .context("failed to compute audit totals")?;

        let status_rows = sqlx::query(
            r#"
            SELECT response_status, COUNT(*)::bigint AS count
            FROM audit_log
            WHERE ts >= $1 AND ts <= $2
            GROUP BY response_status
            ORDER BY response_status
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .context("failed to compute per-status counts")?;

        let total_requests: i64 = totals.get("total_requests");
        let blocked_requests: i64 = totals.get("blocked_requests");
        let block_rate = if total_requests > 0 {
            blocked_requests as f64 / total_requests as f64
        } else {
            0.0
        };

        Ok(AuditStats {
            total_requests,
            blocked_requests,
            block_rate,
            avg_latency_ms: totals.get("avg_latency"),
            unique_callers: totals.get("unique_callers"),
            counts_by_status: status_rows
                .into_iter()
                .map(|r| (r.get::<i32, _>("response_status"), r.get::<i64, _>("count")))
                .collect(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.context("audit store health check failed")?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> AuditEntry {
    use super::model::BlockReason;
    let block_reason_str: Option<String> = row.get("block_reason");
    AuditEntry {
        id: Some(row.get("id")),
        request_id: row.get("request_id"),
        timestamp: row.get("ts"),
        method: row.get("method"),
        path: row.get("path"),
        caller_fingerprint: row.get("caller_fingerprint"),
        user_agent_fingerprint: row.get("user_agent_fingerprint"),
        key_fingerprint: row.get("key_fingerprint"),
        request_bytes: row.get("request_bytes"),
        response_status: row.get("response_status"),
        response_bytes: row.get("response_bytes"),
        latency_ms: row.get("latency_ms"),
        is_blocked: row.get("is_blocked"),
        block_reason: block_reason_str.and_then(|s| match s.as_str() {
            "rate-limit" => Some(BlockReason::RateLimit),
            "content-policy-violation" => Some(BlockReason::ContentPolicyViolation),
            _ => None,
        }),
        detected_issues_count: row.get("detected_issues_count"),
        security_confidence: row.get("security_confidence"),
        llm_provider: row.get("llm_provider"),
        llm_model: row.get("llm_model"),
        metadata: row.get("metadata"),
        retention_until: row.get("retention_until"),
    }
}

/// In-process fake for tests (§8 testable properties 6 and 7, and the
/// admission pipeline's end-to-end tests).
#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    rows: Arc<Mutex<Vec<AuditEntry>>>,
    next_id: Arc<Mutex<i64>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self { rows: Arc::new(Mutex::new(Vec::new())), next_id: Arc::new(Mutex::new(1)) }
    }

    pub async fn all(&self) -> Vec<AuditEntry> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, mut entry: AuditEntry) -> Result<i64> {
        let mut id_guard = self.next_id.lock().await;
        let id = *id_guard;
        *id_guard += 1;
        entry.id = Some(id);
        self.rows.lock().await.push(entry);
        Ok(id)
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let filter = filter.normalized();
        let rows = self.rows.lock().await;
        let mut matched: Vec<AuditEntry> = rows
            .iter()
            .filter(|e| filter.since.map_or(true, |s| e.timestamp >= s))
            .filter(|e| filter.until.map_or(true, |u| e.timestamp <= u))
            .filter(|e| filter.caller_fingerprint.as_deref().map_or(true, |cf| e.caller_fingerprint.as_deref() == Some(cf)))
            .filter(|e| filter.is_blocked.map_or(true, |b| e.is_blocked == b))
            .filter(|e| filter.response_status.map_or(true, |s| e.response_status == s))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.limit.max(0) as usize;
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        rows.retain(|e| e.caller_fingerprint.as_deref() != Some(fingerprint));
        Ok((before - rows.len()) as u64)
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let before = rows.len();
        let now = Utc::now();
        rows.retain(|e| e.retention_until >= now);
        Ok((before - rows.len()) as u64)
    }

    async fn stats_over(&self, since: chrono::DateTime<Utc>, until: chrono::DateTime<Utc>) -> Result<AuditStats> {
        let rows = self.rows.lock().await;
        let in_range: Vec<&AuditEntry> = rows.iter().filter(|e| e.timestamp >= since && e.timestamp <= until).collect();
        let total_requests = in_range.len() as i64;
        let blocked_requests = in_range.iter().filter(|e| e.is_blocked).count() as i64;
        let block_rate = if total_requests > 0 { blocked_requests as f64 / total_requests as f64 } else { 0.0 };
        let avg_latency_ms = if total_requests > 0 {
            in_range.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total_requests as f64
        } else {
            0.0
        };
        let mut callers: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut by_status: HashMap<i32, i64> = HashMap::new();
        for e in &in_range {
            if let Some(cf) = e.caller_fingerprint.as_deref() {
                callers.insert(cf);
            }
            *by_status.entry(e.response_status).or_insert(0) += 1;
        }
        let mut counts_by_status: Vec<(i32, i64)> = by_status.into_iter().collect();
        counts_by_status.sort_by_key(|(status, _)| *status);
        Ok(AuditStats {
            total_requests,
            blocked_requests,
            block_rate,
            avg_latency_ms,
            unique_callers: callers.len() as i64,
            counts_by_status,
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn row(caller_fingerprint: &str, is_blocked: bool, response_status: i32, age: Duration) -> AuditEntry {
        let now = Utc::now() - age;
        AuditEntry {
            id: None,
            request_id: "req-1".into(),
            timestamp: now,
            method: "POST".into(),
            path: "/v1/chat/completions".into(),
            caller_fingerprint: Some(caller_fingerprint.into()),
            user_agent_fingerprint: None,
            key_fingerprint: None,
            request_bytes: 10,
            response_status,
            response_bytes: 20,
            latency_ms: 5,
            is_blocked,
            block_reason: if is_blocked { Some(super::super::model::BlockReason::ContentPolicyViolation) } else { None },
            detected_issues_count: if is_blocked { 1 } else { 0 },
            security_confidence: Some(0.5),
            llm_provider: None,
            llm_model: None,
            metadata: serde_json::json!({}),
            retention_until: now + Duration::days(90),
        }
    }

    #[tokio::test]
    async fn query_filters_by_caller_and_blocked_state() {
        let store = InMemoryAuditStore::new();
        store.insert(row("alice", true, 403, Duration::minutes(1))).await.unwrap();
        store.insert(row("bob", false, 501, Duration::minutes(1))).await.unwrap();

        let filter = AuditFilter { caller_fingerprint: Some("alice".into()), limit: 100, offset: 0, ..Default::default() };
        let rows = store.query(filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].caller_fingerprint.as_deref(), Some("alice"));

        let filter = AuditFilter { is_blocked: Some(false), limit: 100, offset: 0, ..Default::default() };
        let rows = store.query(filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].caller_fingerprint.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_respects_limit_offset() {
        let store = InMemoryAuditStore::new();
        let mut oldest = row("alice", false, 200, Duration::minutes(3));
        oldest.request_bytes = 3;
        let mut middle = row("alice", false, 200, Duration::minutes(2));
        middle.request_bytes = 2;
        let mut newest = row("alice", false, 200, Duration::minutes(1));
        newest.request_bytes = 1;
        store.insert(oldest).await.unwrap();
        store.insert(middle).await.unwrap();
        store.insert(newest).await.unwrap();

        let all = store.query(AuditFilter { limit: 100, offset: 0, ..Default::default() }).await.unwrap();
        assert_eq!(all.iter().map(|e| e.request_bytes).collect::<Vec<_>>(), vec![1, 2, 3]);

        let page = store.query(AuditFilter { limit: 1, offset: 1, ..Default::default() }).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].request_bytes, 2);
    }

    #[tokio::test]
    async fn erase_by_caller_only_removes_matching_rows() {
        let store = InMemoryAuditStore::new();
        store.insert(row("alice", true, 403, Duration::minutes(1))).await.unwrap();
        store.insert(row("bob", false, 200, Duration::minutes(1))).await.unwrap();

        let deleted = store.erase_by_caller("alice").await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = store.all().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].caller_fingerprint.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_rows_past_retention() {
        let store = InMemoryAuditStore::new();
        let mut expired = row("alice", false, 200, Duration::minutes(1));
        expired.retention_until = Utc::now() - Duration::days(1);
        store.insert(expired).await.unwrap();
        store.insert(row("bob", false, 200, Duration::minutes(1))).await.unwrap();

        let deleted = store.sweep_expired().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn stats_over_computes_block_rate_and_status_counts() {
        let store = InMemoryAuditStore::new();
        store.insert(row("alice", true, 403, Duration::minutes(1))).await.unwrap();
        store.insert(row("alice", false, 501, Duration::minutes(1))).await.unwrap();
        store.insert(row("bob", false, 501, Duration::minutes(1))).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let until = Utc::now() + Duration::hours(1);
        let stats = store.stats_over(since, until).await.unwrap();

        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.blocked_requests, 1);
        assert!((stats.block_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(stats.unique_callers, 2);
        assert_eq!(stats.counts_by_status, vec![(403, 1), (501, 2)]);
    }

    #[tokio::test]
    async fn stats_over_excludes_rows_outside_the_window() {
        let store = InMemoryAuditStore::new();
        store.insert(row("alice", false, 200, Duration::hours(5))).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let until = Utc::now() + Duration::hours(1);
        let stats = store.stats_over(since, until).await.unwrap();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.block_rate, 0.0);
    }
}
