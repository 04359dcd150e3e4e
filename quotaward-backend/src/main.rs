use anyhow::Context;
use quotaward_backend::config::Config;
use quotaward_backend::{AppState, Engine, RateLimitConfig, create_app};
use quotaward_db::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing for structured logging, RUST_LOG overrides the level
    #[cfg(debug_assertions)]
    let log_level = "debug";
    #[cfg(not(debug_assertions))]
    let log_level = "info";

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();
    tracing::info!("Starting quotaward backend server...");

    // Load configuration from environment variables or use defaults
    let config = Config::from_env();
    tracing::info!(
        "Configuration: port={}, db_path={}, body_limit={}KB, timeout={}s, admin_routes={}",
        config.port,
        config.database_path,
        config.request_body_limit / 1024,
        config.request_timeout.as_secs(),
        config.admin_token.is_some()
    );
    tracing::info!(
        "Refresh: bans={}s, settings={}s, playtime={}s, quiet grace={}s",
        config.ban_refresh.as_secs(),
        config.settings_refresh.as_secs(),
        config.playtime_refresh.as_secs(),
        config.quiet_grace.as_secs()
    );

    let db = Database::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_path))?;
    let engine = Engine::new(Arc::new(db), config.engine_config())
        .context("invalid DEVICE_INFO_VOLATILE_PATTERN")?;
    engine.start().await;

    let state = Arc::new(AppState {
        engine,
        admin_token: config.admin_token.clone(),
    });
    let rate_limit = (config.rate_limit_per_sec > 0).then(|| RateLimitConfig {
        per_sec: config.rate_limit_per_sec,
        burst: config.rate_limit_burst,
    });
    let app = create_app(
        state.clone(),
        config.request_body_limit,
        config.request_timeout,
        rate_limit,
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    })
    .await;

    let report = state.engine.shutdown().await;
    tracing::info!(
        "Final playtime flush: written={}, failed={}",
        report.written,
        report.failed
    );

    served.context("server error")
}
