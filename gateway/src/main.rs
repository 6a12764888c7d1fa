use anyhow::Context;
use llm_security_gateway::analyzer::GrpcAnalyzerClient;
use llm_security_gateway::app_state::AppState;
use llm_security_gateway::audit::{AuditQueue, PostgresAuditStore};
use llm_security_gateway::config::GatewayConfig;
use llm_security_gateway::metrics::GatewayMetrics;
use llm_security_gateway::rate_limit::store::RedisStore;
use llm_security_gateway::rate_limit::RateLimiter;
use llm_security_gateway::shutdown;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let started_at = std::time::Instant::now();
    let config = Arc::new(GatewayConfig::from_env()?);

    let rate_limit_store = RedisStore::connect(&config.redis_url)
        .await
        .context("failed to connect to the rate-limit store")?;
    let rate_limiter = Arc::new(RateLimiter::new(
        Arc::new(rate_limit_store),
        config.redis_prefix.clone(),
        config.rate_limit.clone(),
    ));

    let audit_store = Arc::new(
        PostgresAuditStore::connect(&config.audit.database_url)
            .await
            .context("failed to connect to the audit store")?,
    );
    audit_store.migrate().await.context("failed to migrate the audit_log table")?;

    let audit_queue = if config.audit.async_mode {
        AuditQueue::spawn_async(audit_store.clone(), config.audit.queue_capacity)
    } else {
        AuditQueue::synchronous(audit_store.clone())
    };

    let analyzer = Arc::new(
        GrpcAnalyzerClient::connect(
            config.analyzer.endpoint(),
            Duration::from_secs(config.analyzer.timeout_secs),
            config.analyzer.max_retries,
        )
        .await
        .context("failed to connect to the content analyzer")?,
    );

    let metrics = Arc::new(GatewayMetrics::new()?);

    if config.admin_token.is_none() {
        tracing::warn!("GATEWAY_ADMIN_TOKEN is unset; /admin/* routes are unauthenticated");
    }

    let digest_salt = gateway_digest::DigestSalt::new(config.digest_salt.clone().into_bytes());

    let state = AppState {
        config: config.clone(),
        rate_limiter,
        analyzer,
        audit_store,
        audit_queue,
        metrics,
        digest_salt,
        started_at,
    };

    let app = llm_security_gateway::build_router(state.clone());

    let ip: std::net::IpAddr = config.bind_host.parse().context("invalid bind host")?;
    let addr = SocketAddr::from((ip, config.bind_port));
    info!(%addr, "starting llm-security-gateway");
    let listener = TcpListener::bind(addr).await?;

    // The whole 5-step drain (spec.md §4.10) shares one ceiling, clocked from
    // the moment the shutdown signal actually arrives — not from process
    // start, since the server may run for days beforehand. Steps 1-2
    // (stop accepting, drain in-flight requests) run on a spawned task so
    // they can be bounded by `tokio::time::timeout` here; steps 3-5 run in
    // `shutdown::drain` afterward, against whatever ceiling remains.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown::wait_for_signal().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.shutdown_ceiling_secs);
    let _ = shutdown_tx.send(());

    let drain_budget = deadline.saturating_duration_since(tokio::time::Instant::now());
    match tokio::time::timeout(drain_budget, server).await {
        Ok(Ok(Ok(()))) => info!("in-flight requests drained"),
        Ok(Ok(Err(err))) => tracing::error!(?err, "server task returned an error while draining"),
        Ok(Err(err)) => tracing::error!(?err, "server task panicked while draining"),
        Err(_) => tracing::error!("in-flight request drain exceeded the shutdown ceiling"),
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let exit_code = shutdown::drain(state, remaining).await;
    std::process::exit(exit_code);
}
