use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::AppState;
use crate::error::AppError;
use crate::helpers::client_ip;

/// Client IP resolved by [`reject_banned_ip`], available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Every request counts as traffic and revives stale caches before it is served.
pub(crate) async fn track_activity(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    state.engine.notify_activity();
    state.engine.check_and_refresh_if_stale().await;
    next.run(request).await
}

pub(crate) async fn reject_banned_ip(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), peer);

    if state.engine.check_ip_banned(&ip) {
        warn!(%ip, "rejected request from banned ip");
        return Err(AppError::Banned);
    }

    request.extensions_mut().insert(ClientIp(ip));
    Ok(next.run(request).await)
}
