//! esn-daemon entry point.
//!
//! One process runs the whole core: the HTTP surface, the lease-gated
//! scheduler, and the worker pool. Ctrl-C flips a shared shutdown signal;
//! workers finish their in-flight jobs, the scheduler completes its sweep,
//! and the server drains.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use esn_config::SentinelConfig;
use esn_daemon::{routes, state};
use esn_db::PgStore;
use esn_queue::PgQueue;
use esn_scheduler::{Scheduler, SchedulerConfig};
use esn_schemas::{SecureTokens, SystemClock};
use esn_workers::{HttpEmailTransport, HttpSmsTransport, PoolConfig, WorkerContext, WorkerPool};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = SentinelConfig::from_env()?;

    let pool = esn_db::connect_from_env().await?;
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(pool));
    let clock = Arc::new(SystemClock);
    let tokens = Arc::new(SecureTokens);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Scheduler: lease-gated, so running extra replicas is safe.
    let scheduler = Scheduler::new(
        store.clone(),
        queue.clone(),
        clock.clone(),
        tokens.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            batch_size: cfg.sweep_batch_size,
            holder: scheduler_holder(),
            base_url: cfg.base_url.clone(),
        },
    );
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    // Worker pool over the five queues.
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        queue: queue.clone(),
        clock: clock.clone(),
        tokens,
        email: Arc::new(HttpEmailTransport::new(
            env_or("ESN_EMAIL_ENDPOINT", "http://127.0.0.1:2525/send"),
            std::env::var("ESN_EMAIL_API_KEY").ok(),
        )),
        sms: Arc::new(HttpSmsTransport::new(
            env_or("ESN_SMS_ENDPOINT", "http://127.0.0.1:2526/send"),
            std::env::var("ESN_SMS_API_KEY").ok(),
        )),
        base_url: cfg.base_url.clone(),
    });
    let pool_cfg = PoolConfig {
        default_concurrency: cfg.worker_concurrency,
        ..PoolConfig::default()
    };
    let workers = WorkerPool::new(ctx, pool_cfg);
    let workers_shutdown = shutdown_rx.clone();
    let workers_task = tokio::spawn(async move { workers.run(workers_shutdown).await });

    // HTTP surface.
    let shared = Arc::new(state::AppState::new(
        store,
        queue,
        clock,
        cfg.admin_token.clone().or_else(|| std::env::var("ESN_ADMIN_TOKEN").ok()),
    ));
    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr: SocketAddr = cfg
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind addr {}", cfg.bind_addr))?;
    info!("esn-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    server.await.context("server crashed")?;

    // Stop background loops and let in-flight work finish.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = workers_task.await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Lease holder identity: hostname + pid keeps replicas distinguishable.
fn scheduler_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
