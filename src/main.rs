//! Audit control plane entry point: loads configuration, opens the durable
//! stores, starts the browser pool and dispatcher, and serves the HTTP/WS API.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use webauditor::browser_pool::{BrowserPool, BrowserPoolConfig};
use webauditor::cache::TtlCache;
use webauditor::circuit_breaker::CircuitBreakerRegistry;
use webauditor::config::AuditConfig;
use webauditor::dispatcher::Dispatcher;
use webauditor::http::{self, ApiState};
use webauditor::limiter::ConcurrencyLimiter;
use webauditor::lighthouse;
use webauditor::queue::JobQueue;
use webauditor::registry::JobRegistry;
use webauditor::singleflight::SingleFlight;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AuditConfig::from_env().context("failed to load configuration")?;

    let cache = Arc::new(
        TtlCache::open(&config.cache_db_path, config.cache_ttl_seconds)
            .await
            .context("failed to open result cache")?,
    );

    let queue_db_path = config
        .cache_db_path
        .parent()
        .map(|dir| dir.join("audit_queue.db"))
        .context("cache path has no parent directory")?;
    let queue = Arc::new(
        JobQueue::open(&queue_db_path, config.max_queue_size)
            .await
            .context("failed to open job queue")?,
    );

    let registry = Arc::new(JobRegistry::new(config.max_jobs_per_ip));
    let limiter = Arc::new(ConcurrencyLimiter::new(config.max_concurrent_audits));
    let broadcaster = Arc::new(webauditor::broadcaster::ProgressBroadcaster::new());
    let singleflight = Arc::new(SingleFlight::new());
    let breakers = Arc::new(CircuitBreakerRegistry::default());

    let browser_pool = BrowserPool::new(BrowserPoolConfig {
        min_pool_size: 2,
        max_pool_size: config.browser_pool_size,
        keepalive_interval: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(config.browser_idle_timeout_seconds),
        launch_timeout: Duration::from_secs(config.browser_launch_timeout_seconds),
        headless: true,
    });
    browser_pool.start().await.context("failed to start browser pool")?;

    let analyzer_path = lighthouse::find_analyzer_executable()
        .await
        .context("lighthouse analyzer binary not found")?;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build http client")?;

    let dispatcher = Dispatcher::new(
        registry,
        queue,
        limiter,
        broadcaster,
        Arc::clone(&cache),
        singleflight,
        browser_pool,
        breakers,
        http_client,
        config.psi_api_key.clone(),
        config.google_api_key.clone(),
        analyzer_path,
        Duration::from_secs(config.audit_timeout_seconds),
        config.queue_timeout_seconds,
    );
    dispatcher.start().await;

    let state = ApiState {
        dispatcher: Arc::clone(&dispatcher),
        cache,
    };

    let router = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, "audit control plane listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server error")?;

    dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
