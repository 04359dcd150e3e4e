use std::net::SocketAddr;

use axum::http::HeaderMap;
use chrono::Utc;

/// Header set by the CDN in front of the game servers.
pub const CLIENT_IP_HEADER: &str = "cf-connecting-ip";

pub fn now() -> i64 {
  Utc::now().timestamp()
}

/// Client IP for ban checks and identity scoring.
///
/// Prefers the CDN header, then the socket peer. Empty if neither is known.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
  headers
    .get(CLIENT_IP_HEADER)
    .and_then(|value| value.to_str().ok())
    .map(str::trim)
    .filter(|ip| !ip.is_empty())
    .map(str::to_string)
    .or_else(|| peer.map(|addr| addr.ip().to_string()))
    .unwrap_or_default()
}
