pub mod auth;
pub mod authorize;
pub mod error;
pub mod health;

use axum::http::{header::USER_AGENT, HeaderMap};
use std::net::SocketAddr;

use crate::identity::client::TransportMetadata;

/// Extract a client IP from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Extract a bearer token from the Authorization header.
pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// User agent and address as seen by this hop. Proxy headers win over the
/// socket peer.
pub(crate) fn transport_metadata(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> TransportMetadata {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let ip_address = extract_client_ip(headers).or_else(|| peer.map(|addr| addr.ip().to_string()));
    TransportMetadata::new(user_agent, ip_address)
}
