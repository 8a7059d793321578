mod cli;
mod codec;
mod config;
mod handlers;
mod security;
mod storage;
mod telemetry;
mod views;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics::gauge;
use riptide_core::memory::{MemoryMonitor, PressureLevel, PressureListener};
use riptide_core::store::{MemorySessionStore, SessionStore};
use riptide_core::SessionManager;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::codec::JsonCodec;
use crate::config::GateConfig;
use crate::handlers::{health_check, metrics_handler, mint_csrf, stats, GateState};
use crate::security::policy_from;
use crate::storage::RedisSessionStore;
use crate::views::{DemoViews, MetricsObserver};
use crate::ws::ws_handler;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = telemetry::init()?;
    let cli = Cli::parse();
    let config = GateConfig::from_env().apply(&cli);
    info!(target: "riptide::gate", port = config.port, "starting riptide gate");

    let store: Arc<dyn SessionStore> = match config.redis_url.as_deref() {
        Some(url) => {
            let store = RedisSessionStore::connect(url, config.store_ttl_seconds)
                .await
                .context("redis session store unavailable")?;
            info!(target: "riptide::gate", "session records persisted to redis");
            Arc::new(store)
        }
        None => {
            warn!(
                target: "riptide::gate",
                "REDIS_URL not set; session records are kept in process memory"
            );
            Arc::new(MemorySessionStore::new(config.engine.max_sessions))
        }
    };

    let manager = SessionManager::new(
        config.engine.clone(),
        Arc::new(DemoViews),
        Arc::new(JsonCodec::new()),
        Some(store),
    );
    manager.add_observer(Arc::new(MetricsObserver));

    let monitor = Arc::new(MemoryMonitor::new(config.monitor.clone()));
    monitor.add_listener(Arc::new(PressureLog));
    let reclaim = manager.clone();
    monitor.set_reclaim_hook(Box::new(move || {
        let trimmed = reclaim.enforce_memory_caps();
        let shed = reclaim.evict_lru((reclaim.stats().active / 10).max(1));
        warn!(
            target: "riptide::gate",
            trimmed,
            shed,
            "reclaimed sessions under memory pressure"
        );
    }));
    let monitor_task = monitor.clone().spawn();

    let gauges = manager.clone();
    let gauge_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let stats = gauges.stats();
            gauge!("riptide_gate_sessions_active", stats.active as f64);
            gauge!("riptide_gate_session_memory_bytes", stats.total_memory as f64);
        }
    });

    let state = GateState {
        manager: manager.clone(),
        codec: Arc::new(JsonCodec::new()),
        csrf: policy_from(config.csrf_secret.as_deref(), config.csrf_ttl),
        config: Arc::new(config.clone()),
        metrics: metrics_handle,
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics_handler))
        .route("/csrf", get(mint_csrf))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(target: "riptide::gate", %addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    gauge_task.abort();
    monitor_task.abort();
    let report = manager.shutdown().await;
    info!(
        target: "riptide::gate",
        sessions = report.sessions,
        persisted = report.persisted,
        closed = report.closed,
        timed_out = report.timed_out,
        "gate stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target: "riptide::gate", error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!(target: "riptide::gate", "shutdown signal received");
}

/// Surfaces monitor pressure in logs; reclaim itself runs through the
/// monitor's cooldown-gated hook.
struct PressureLog;

impl PressureListener for PressureLog {
    fn on_soft_limit(&self, usage_bytes: u64, level: PressureLevel) {
        warn!(
            target: "riptide::gate",
            usage_bytes,
            ?level,
            "process memory above soft limit"
        );
    }

    fn on_hard_limit(&self, usage_bytes: u64, level: PressureLevel) {
        error!(
            target: "riptide::gate",
            usage_bytes,
            ?level,
            "process memory above hard limit"
        );
    }
}
