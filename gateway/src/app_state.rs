use crate::analyzer::ContentAnalyzer;
use crate::audit::{AuditQueue, AuditStore};
use crate::config::GatewayConfig;
use crate::metrics::GatewayMetrics;
use crate::rate_limit::RateLimiter;
use gateway_digest::DigestSalt;
use std::sync::Arc;
use std::time::Instant;

/// Explicitly-constructed service bundle passed into every handler, with one
/// construction site at startup (`main.rs`). Replaces the source's global
/// singletons (analyzer client, audit logger, rate limiter, digest helper)
/// per spec.md §9, eliminating initialization-order hazards.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub analyzer: Arc<dyn ContentAnalyzer>,
    pub audit_store: Arc<dyn AuditStore>,
    pub audit_queue: Arc<AuditQueue>,
    pub metrics: Arc<GatewayMetrics>,
    pub digest_salt: DigestSalt,
    /// Stamped once in `main.rs` before any dependency connects; backs the
    /// `uptime` field of `GET /health` (spec.md §6.1).
    pub started_at: Instant,
}

impl AppState {
    pub fn digest(&self, input: Option<&str>) -> Option<String> {
        gateway_digest::digest(input, &self.digest_salt)
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }
}
