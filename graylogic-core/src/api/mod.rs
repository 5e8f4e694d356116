//! REST and WebSocket surface
//!
//! Middleware order, outer to inner: security headers → CORS → request-size
//! cap → rate limit (auth routes only) → auth → permission and scope checks
//! in handlers.

pub mod auth;
pub mod devices;
pub mod panels;
pub mod scenes;
pub mod system;
pub mod users;
pub mod ws;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{apply_security_headers, auth_middleware, rate_limit_middleware};
use crate::state::AppState;

/// Build the full `/api/v1` router
pub fn router(state: AppState) -> Router {
    // Public, rate-limited
    let public = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .layer(from_fn_with_state(state.clone(), rate_limit_middleware));

    // Everything behind authentication
    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/change-password", post(auth::change_password))
        .route("/auth/ws-ticket", post(auth::ws_ticket))
        .route("/site", get(system::site))
        .route("/site/mode", put(system::set_mode))
        .route("/areas", get(system::areas))
        .route("/rooms", get(system::rooms))
        .route("/zones", get(system::zones))
        .route("/groups", get(system::groups))
        .route("/devices", get(devices::list).post(devices::create))
        .route(
            "/devices/{id}",
            get(devices::get).patch(devices::patch).delete(devices::delete),
        )
        .route("/devices/{id}/state", put(devices::put_state))
        .route("/devices/{id}/history", get(devices::history))
        .route("/devices/{id}/metrics", get(devices::metrics))
        .route("/scenes", get(scenes::list).post(scenes::create))
        .route(
            "/scenes/{id}",
            get(scenes::get).patch(scenes::patch).delete(scenes::delete),
        )
        .route("/scenes/{id}/activate", post(scenes::activate))
        .route("/users", get(users::list).post(users::create))
        .route(
            "/users/{id}",
            get(users::get).patch(users::patch).delete(users::delete),
        )
        .route(
            "/users/{id}/rooms",
            get(users::rooms).put(users::replace_rooms),
        )
        .route(
            "/users/{id}/sessions",
            get(users::sessions).delete(users::revoke_sessions),
        )
        .route("/panels", get(panels::list).post(panels::create))
        .route(
            "/panels/{id}",
            get(panels::get).patch(panels::patch).delete(panels::delete),
        )
        .route("/metrics", get(system::metrics))
        .route("/discovery", get(system::discovery))
        .route("/system/factory-reset", post(system::factory_reset))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let api = Router::new()
        .route("/health", get(system::health))
        .route("/ws", get(ws::ws_handler))
        .merge(public)
        .merge(protected);

    let server_config = state.config.server.clone();
    let mut app = Router::new()
        .nest("/api/v1", api)
        .layer(RequestBodyLimitLayer::new(server_config.body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // CORS only when origins are configured; default is same-origin
    if !server_config.cors_origins.is_empty() {
        let origins: Vec<_> = server_config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        app = app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    }

    apply_security_headers(app, server_config.tls_enabled)
}
