pub mod store;

use crate::config::{RateLimitConfig, TierConfig};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use store::RateLimitStore;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Global,
    PerCaller,
    PerKey,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Global => "global",
            Tier::PerCaller => "per_caller",
            Tier::PerKey => "per_key",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable per-check record, per spec.md §3.1 "Rate-limit decision".
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub tier: Option<Tier>,
    pub allowed: bool,
    pub limit: Option<u32>,
    pub remaining: Option<i64>,
    pub reset_epoch: Option<i64>,
    pub retry_after_secs: Option<i64>,
}

impl RateDecision {
    fn fail_open() -> Self {
        Self {
            tier: None,
            allowed: true,
            limit: None,
            remaining: None,
            reset_epoch: None,
            retry_after_secs: None,
        }
    }

    /// Used when `GatewayConfig.features.rate_limiting` is off — same shape
    /// as `fail_open`, named separately since the two have different causes.
    pub fn disabled() -> Self {
        Self::fail_open()
    }
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").as_secs() as i64
}

/// Three-tier fixed-window admission decision, per spec.md §4.5.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    prefix: String,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, prefix: impl Into<String>, config: RateLimitConfig) -> Self {
        Self { store, prefix: prefix.into(), config }
    }

    fn key(&self, tier: Tier, identifier: &str, window_start: i64) -> String {
        format!("{}:{}:{}:{}", self.prefix, tier, identifier, window_start)
    }

    async fn check_tier(&self, tier: Tier, identifier: &str, cfg: TierConfig) -> anyhow::Result<RateDecision> {
        let now = now_epoch();
        let window_start = now - (now % cfg.window_secs as i64);
        let key = self.key(tier, identifier, window_start);

        let (count, ttl) = self.store.increment_and_get_ttl(&key).await?;
        if ttl < 0 {
            // Freshly created bucket: give it an explicit expiry so it cannot
            // leak past its window.
            self.store.set_expiry(&key, cfg.window_secs).await?;
        }

        let reset = window_start + cfg.window_secs as i64;
        if count > cfg.max as i64 {
            return Ok(RateDecision {
                tier: Some(tier),
                allowed: false,
                limit: Some(cfg.max),
                remaining: Some(0),
                reset_epoch: Some(reset),
                retry_after_secs: Some((reset - now).max(0)),
            });
        }

        Ok(RateDecision {
            tier: Some(tier),
            allowed: true,
            limit: Some(cfg.max),
            remaining: Some((cfg.max as i64 - count).max(0)),
            reset_epoch: Some(reset),
            retry_after_secs: None,
        })
    }

    /// Evaluates global -> per-caller -> per-key in order, short-circuiting
    /// on the first denial. Every store failure along the way makes the
    /// whole check fail-open (the store is advisory, never a SPOF).
    pub async fn check(&self, caller_identifier: &str, key_identifier: Option<&str>) -> RateDecision {
        match self.try_check(caller_identifier, key_identifier).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(?err, "rate limit store call failed, failing open");
                RateDecision::fail_open()
            }
        }
    }

    async fn try_check(&self, caller_identifier: &str, key_identifier: Option<&str>) -> anyhow::Result<RateDecision> {
        let global = self.check_tier(Tier::Global, "*", self.config.global).await?;
        if !global.allowed {
            return Ok(global);
        }

        let per_caller = self.check_tier(Tier::PerCaller, caller_identifier, self.config.per_caller).await?;
        if !per_caller.allowed {
            return Ok(per_caller);
        }

        if let Some(key_id) = key_identifier {
            let per_key = self.check_tier(Tier::PerKey, key_id, self.config.per_key).await?;
            return Ok(per_key);
        }

        Ok(per_caller)
    }

    /// Deletes every bucket matching `rate_limit:{tier}:{identifier}:*`.
    pub async fn reset(&self, tier: Tier, identifier: &str) -> anyhow::Result<usize> {
        let prefix = format!("{}:{}:{}:", self.prefix, tier, identifier);
        let keys = self.store.keys_matching(&prefix).await?;
        let count = keys.len();
        self.store.delete(&keys).await?;
        Ok(count)
    }

    /// Reads the current bucket without incrementing it, by reading whatever
    /// the current window's key holds. There is no "peek" primitive in the
    /// store contract, so status is approximated via `keys_matching` plus a
    /// best-effort read through the same increment-based key naming: callers
    /// needing an exact read should prefer `check`'s side effects.
    pub async fn status(&self, tier: Tier, identifier: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{}:{}:{}:", self.prefix, tier, identifier);
        self.store.keys_matching(&prefix).await
    }

    /// Used by the `/ready` probe; deliberately not fail-open, since
    /// readiness is exactly where an unreachable store should count.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use store::{AlwaysFailingStore, InMemoryStore};

    fn config(global_max: u32, per_caller_max: u32, per_key_max: u32) -> RateLimitConfig {
        RateLimitConfig {
            global: TierConfig { max: global_max, window_secs: 60 },
            per_caller: TierConfig { max: per_caller_max, window_secs: 60 },
            per_key: TierConfig { max: per_key_max, window_secs: 60 },
        }
    }

    #[tokio::test]
    async fn global_exhaustion_denies_and_short_circuits() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RateLimiter::new(store, "rate_limit", config(2, 100, 1000));

        let d1 = limiter.check("caller-a", None).await;
        assert!(d1.allowed);
        assert_eq!(d1.remaining, Some(1));

        let d2 = limiter.check("caller-b", None).await;
        assert!(d2.allowed);
        assert_eq!(d2.remaining, Some(0));

        let d3 = limiter.check("caller-c", None).await;
        assert!(!d3.allowed);
        assert_eq!(d3.tier, Some(Tier::Global));
        assert!(d3.retry_after_secs.unwrap() <= 60);
    }

    #[tokio::test]
    async fn per_key_tier_evaluated_last_and_most_specific_wins() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RateLimiter::new(store, "rate_limit", config(10_000, 100, 2));

        let d1 = limiter.check("caller-a", Some("key-1")).await;
        assert!(d1.allowed);
        assert_eq!(d1.tier, Some(Tier::PerKey));

        let d2 = limiter.check("caller-a", Some("key-1")).await;
        assert!(d2.allowed);

        let d3 = limiter.check("caller-a", Some("key-1")).await;
        assert!(!d3.allowed);
        assert_eq!(d3.tier, Some(Tier::PerKey));
    }

    #[tokio::test]
    async fn store_failure_fails_open_with_no_headers() {
        let store = Arc::new(AlwaysFailingStore);
        let limiter = RateLimiter::new(store, "rate_limit", config(1, 1, 1));
        let decision = limiter.check("caller-a", None).await;
        assert!(decision.allowed);
        assert!(decision.limit.is_none());
        assert!(decision.remaining.is_none());
    }

    #[tokio::test]
    async fn reset_deletes_all_buckets_for_identifier() {
        let store = Arc::new(InMemoryStore::new());
        let limiter = RateLimiter::new(store, "rate_limit", config(10, 10, 10));
        limiter.check("caller-a", None).await;
        let deleted = limiter.reset(Tier::PerCaller, "caller-a").await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = limiter.status(Tier::PerCaller, "caller-a").await.unwrap();
        assert!(remaining.is_empty());
    }
}
