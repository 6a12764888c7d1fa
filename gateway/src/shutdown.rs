//! Ordered drain on termination, per spec.md §4.10 "Shutdown coordinator".
//! Not present in the teacher (whose services run forever) — built in
//! idiomatic tokio/axum style rather than copied, and documented as net-new
//! in DESIGN.md. Steps 1-2 (stop accepting connections, drain in-flight
//! requests) are handled by `axum::serve(..).with_graceful_shutdown(..)`
//! itself; this module covers the signal wait and steps 3-5.

use crate::app_state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};

/// Resolves once either `ctrl_c` or (on unix) `SIGTERM` is received. Pass
/// this to `axum::serve(..).with_graceful_shutdown(..)`.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

/// Steps 3-5 of spec.md §4.10, run after `axum::serve` returns (i.e. after
/// steps 1-2 have already completed). Returns the process exit code: 0 on
/// success, 1 if the overall ceiling was reached before step 4 finished.
pub async fn drain(state: AppState, ceiling: Duration) -> i32 {
    let deadline = tokio::time::Instant::now() + ceiling;

    let flush_budget = deadline.saturating_duration_since(tokio::time::Instant::now());
    let flushed = tokio::time::timeout(flush_budget, state.audit_queue.flush()).await;
    if flushed.is_err() {
        warn!("audit queue flush did not complete before the shutdown ceiling");
    } else {
        info!("audit queue flushed");
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let closed = tokio::time::timeout(remaining, async {
        state.analyzer.shutdown().await;
        state.audit_store.close().await;
    })
    .await;

    match closed {
        Ok(()) => {
            info!("analyzer channel and audit store pool closed");
            0
        }
        Err(_) => {
            error!("shutdown ceiling reached before dependencies closed");
            1
        }
    }
}
