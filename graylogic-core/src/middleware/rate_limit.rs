//! Rate-limiting middleware for the auth routes

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

use crate::auth::{client_ip, LOGIN_LIMIT, REFRESH_LIMIT};
use crate::error::Result;
use crate::state::AppState;

/// Enforce the per-IP windows on `/auth/login` and `/auth/refresh`
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let (class, limit) = match request.uri().path() {
        path if path.ends_with("/login") => ("login", LOGIN_LIMIT),
        path if path.ends_with("/refresh") => ("refresh", REFRESH_LIMIT),
        _ => return Ok(next.run(request).await),
    };

    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let ip = client_ip(remote.ip(), forwarded, state.config.server.trust_proxy);

    state.rate_limiter.check(class, ip, limit)?;
    Ok(next.run(request).await)
}
