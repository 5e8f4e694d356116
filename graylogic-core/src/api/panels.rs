//! Panel management endpoints (`panel:manage`)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::audit::AuditRecord;
use crate::auth::Permission;
use crate::error::Result;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// GET /panels
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::PanelManage)?;
    Ok(Json(state.auth.panels.list().await?))
}

/// GET /panels/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::PanelManage)?;
    Ok(Json(state.auth.panels.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreatePanelRequest {
    pub name: String,
    #[serde(default)]
    pub room_ids: Vec<String>,
}

/// POST /panels — the token is revealed in this response and never again
pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreatePanelRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::PanelManage)?;
    let (panel, token) = state.auth.panels.create(&body.name, &body.room_ids).await?;
    state
        .audit
        .log(AuditRecord::new("create", "panel", &panel.id).by_user(&ctx.subject_id))
        .await;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "panel": panel, "token": token })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PatchPanelRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub room_ids: Option<Vec<String>>,
}

/// PATCH /panels/{id} — name changes persist
pub async fn patch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PatchPanelRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::PanelManage)?;
    let panel = state
        .auth
        .panels
        .update(
            &id,
            body.name.as_deref(),
            body.is_active,
            body.room_ids.as_deref(),
        )
        .await?;
    state
        .audit
        .log(AuditRecord::new("update", "panel", &panel.id).by_user(&ctx.subject_id))
        .await;
    Ok(Json(panel))
}

/// DELETE /panels/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::PanelManage)?;
    state.auth.panels.delete(&id).await?;
    state
        .audit
        .log(AuditRecord::new("delete", "panel", &id).by_user(&ctx.subject_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}
