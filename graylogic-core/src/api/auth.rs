//! Authentication endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::middleware::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device_info: Option<String>,
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let (pair, user) = state
        .auth
        .login(&body.username, &body.password, body.device_info.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "access_token": pair.access_token,
        "refresh_token": pair.refresh_token,
        "user": user,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<impl IntoResponse> {
    let pair = state.auth.refresh(&body.refresh_token).await?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<LogoutRequest>,
) -> Result<impl IntoResponse> {
    state.auth.logout(&body.refresh_token, &ctx.subject_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
}

/// POST /auth/change-password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<impl IntoResponse> {
    if ctx.is_panel {
        return Err(Error::Forbidden("panels have no password".to_string()));
    }
    state
        .auth
        .change_password(&ctx.subject_id, &body.old_password, &body.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /auth/ws-ticket — mint a one-shot WebSocket ticket
pub async fn ws_ticket(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    if ctx.is_panel {
        return Err(Error::Forbidden(
            "panels connect with their own identity".to_string(),
        ));
    }
    let ticket = state.auth.tickets.issue(&ctx.subject_id).await?;
    Ok(Json(serde_json::json!({ "ticket": ticket, "expires_in": 60 })))
}
