use anyhow::{Context, Result};
use std::env;

/// Thresholds for one rate-limit tier: allow up to `max` increments per
/// `window_secs`-wide fixed window.
#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
    pub max: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: TierConfig,
    pub per_caller: TierConfig,
    pub per_key: TierConfig,
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl AnalyzerConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub database_url: String,
    pub async_mode: bool,
    pub retention_days: i64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub min_content_length: usize,
    pub max_content_length: usize,
}

#[derive(Debug, Clone)]
pub struct FeatureFlags {
    pub audit_logging: bool,
    pub rate_limiting: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub redis_url: String,
    pub redis_prefix: String,
    pub rate_limit: RateLimitConfig,
    pub analyzer: AnalyzerConfig,
    pub audit: AuditConfig,
    pub security: SecurityConfig,
    pub features: FeatureFlags,
    pub digest_salt: String,
    pub models: Vec<String>,
    pub shutdown_ceiling_secs: u64,
    /// Bearer token gating `/admin/*`. `None` means the admin surface is
    /// unauthenticated — acceptable only behind a trusted operator network,
    /// and logged loudly at startup (see `main.rs`).
    pub admin_token: Option<String>,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn tier(prefix: &str, default_max: u32, default_window: u64) -> TierConfig {
    TierConfig {
        max: env_parsed(&format!("GATEWAY_RATE_LIMIT_{}_MAX", prefix), default_max),
        window_secs: env_parsed(&format!("GATEWAY_RATE_LIMIT_{}_WINDOW_SECONDS", prefix), default_window).max(1),
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let digest_salt = env::var("GATEWAY_DIGEST_SALT").context("GATEWAY_DIGEST_SALT must be set")?;

        let bind_host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let bind_port: u16 = env_parsed("PORT", 8080);

        let rate_limit = RateLimitConfig {
            global: tier("GLOBAL", 10_000, 3600),
            per_caller: tier("PER_CALLER", 100, 3600),
            per_key: tier("PER_KEY", 1_000, 3600),
        };

        let analyzer = AnalyzerConfig {
            host: env::var("ANALYZER_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_parsed("ANALYZER_PORT", 50051),
            timeout_secs: env_parsed("ANALYZER_TIMEOUT_SECONDS", 5),
            max_retries: env_parsed("ANALYZER_MAX_RETRIES", 3),
        };

        let audit = AuditConfig {
            database_url,
            async_mode: env_parsed("AUDIT_ASYNC", true),
            retention_days: env_parsed("AUDIT_RETENTION_DAYS", 90),
            queue_capacity: env_parsed("AUDIT_QUEUE_CAPACITY", 1000),
        };

        let security = SecurityConfig {
            min_content_length: env_parsed("SECURITY_MIN_CONTENT_LENGTH", 1),
            max_content_length: env_parsed("SECURITY_MAX_CONTENT_LENGTH", 10_240),
        };

        let features = FeatureFlags {
            audit_logging: env_parsed("FEATURES_AUDIT_LOGGING", true),
            rate_limiting: env_parsed("FEATURES_RATE_LIMITING", true),
        };

        let models = env::var("GATEWAY_MODELS")
            .unwrap_or_else(|_| "gpt-4,gpt-3.5-turbo".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_host,
            bind_port,
            redis_url,
            redis_prefix: env::var("GATEWAY_RATE_LIMIT_PREFIX").unwrap_or_else(|_| "rate_limit".to_string()),
            rate_limit,
            analyzer,
            audit,
            security,
            features,
            digest_salt,
            models,
            shutdown_ceiling_secs: env_parsed("GATEWAY_SHUTDOWN_CEILING_SECONDS", 10),
            admin_token: env::var("GATEWAY_ADMIN_TOKEN").ok(),
        })
    }
}
