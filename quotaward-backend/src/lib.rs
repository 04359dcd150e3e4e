pub mod bans;
pub mod config;
pub mod device_info;
pub mod engine;
mod error;
pub mod helpers;
pub mod identity;
mod middleware;
pub mod playtime;
mod routes;
pub mod scheduler;
pub mod settings;
pub mod snapshot;
pub mod store;
mod validation;

pub use engine::{Engine, EngineConfig};
pub use error::{ErrorResponse, QuotaError, RefreshError};
pub use store::Store;

use axum::{
    Router,
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub engine: Engine,
    /// Admin routes reject every request when unset
    pub admin_token: Option<String>,
}

/// Rate limiting configuration, keyed by client IP
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per second
    pub per_sec: u64,
    /// Burst size
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_sec: 20,
            burst: 40,
        }
    }
}

/// Create the application router around a started engine
pub fn create_app(
    state: Arc<AppState>,
    request_body_limit: usize,
    request_timeout: Duration,
    rate_limit: Option<RateLimitConfig>,
) -> Router {
    let game_routes = Router::new()
        .route("/login", post(routes::login))
        .route("/heartbeat", post(routes::heartbeat))
        .route("/playtime/{device_id}", get(routes::playtime))
        .route("/settings", get(routes::settings));

    let admin_routes = Router::new()
        .route("/admin/bonus", post(routes::grant_bonus))
        .route("/admin/vip", post(routes::set_vip));

    let mut app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .merge(game_routes)
        .merge(admin_routes)
        // Runs after the activity layer below
        .layer(from_fn_with_state(state.clone(), middleware::reject_banned_ip))
        .layer(from_fn_with_state(state.clone(), middleware::track_activity));

    // The quota is replenished one request at a time
    let governor = rate_limit.and_then(|rate_limit| {
        GovernorConfigBuilder::default()
            .per_millisecond((1000 / rate_limit.per_sec.max(1)).max(1))
            .burst_size(rate_limit.burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
    });
    if let Some(governor) = governor {
        app = app.layer(GovernorLayer::new(governor));
    }

    app.layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        request_timeout,
    ))
    .layer(RequestBodyLimitLayer::new(request_body_limit))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
