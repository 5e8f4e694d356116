//! Scene endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::auth::Permission;
use crate::error::{Error, Result};
use crate::middleware::AuthContext;
use crate::registry::models::{ActionTarget, Scene, SceneAction};
use crate::state::AppState;

/// GET /scenes
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SceneRead)?;
    let scenes = state.scenes.list().await?;
    let visible = ctx.scope.filter(scenes, |s| s.room_id.clone());
    Ok(Json(visible))
}

/// GET /scenes/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SceneRead)?;
    let scene = state.scenes.get(&id).await?;
    ctx.scope.require(scene.room_id.as_deref())?;
    Ok(Json(scene))
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub target: ActionTarget,
    pub command: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub fade_ms: u64,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub sort_order: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateSceneRequest {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionRequest>,
}

fn default_true() -> bool {
    true
}
fn default_priority() -> i64 {
    50
}

fn materialize_actions(scene_id: &str, actions: Vec<ActionRequest>) -> Vec<SceneAction> {
    actions
        .into_iter()
        .enumerate()
        .map(|(index, a)| SceneAction {
            id: Uuid::new_v4().to_string(),
            scene_id: scene_id.to_string(),
            target: a.target,
            command: a.command,
            parameters: a.parameters,
            delay_ms: a.delay_ms,
            fade_ms: a.fade_ms,
            parallel: a.parallel,
            continue_on_error: a.continue_on_error,
            sort_order: if a.sort_order != 0 { a.sort_order } else { index as i64 },
        })
        .collect()
}

/// Scene-management gate: admin/owner pass outright; `user` needs the
/// per-room manage bit on the scene's room.
fn require_manage(ctx: &AuthContext, room_id: Option<&str>) -> Result<()> {
    ctx.require(Permission::SceneManage)?;
    match room_id {
        Some(room_id) if ctx.scope.can_manage_scenes(room_id) => Ok(()),
        Some(_) => Err(Error::Forbidden(
            "scene management not granted for this room".to_string(),
        )),
        // Site-wide scenes are admin territory
        None => match ctx.scope {
            crate::auth::RoomScope::Unrestricted => Ok(()),
            _ => Err(Error::Forbidden(
                "site-wide scenes require admin".to_string(),
            )),
        },
    }
}

/// POST /scenes
pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateSceneRequest>,
) -> Result<impl IntoResponse> {
    require_manage(&ctx, body.room_id.as_deref())?;
    let id = Uuid::new_v4().to_string();
    let scene = Scene {
        actions: materialize_actions(&id, body.actions),
        id,
        name: body.name,
        slug: body.slug,
        room_id: body.room_id,
        area_id: body.area_id,
        enabled: body.enabled,
        priority: body.priority,
        icon: body.icon,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let created = state.scenes.create(&scene).await?;
    state
        .audit
        .log(AuditRecord::new("create", "scene", &created.id).by_user(&ctx.subject_id))
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct PatchSceneRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room_id: Option<Option<String>>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub icon: Option<Option<String>>,
    #[serde(default)]
    pub actions: Option<Vec<ActionRequest>>,
}

/// PATCH /scenes/{id}
pub async fn patch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PatchSceneRequest>,
) -> Result<impl IntoResponse> {
    let mut scene = state.scenes.get(&id).await?;
    require_manage(&ctx, scene.room_id.as_deref())?;

    if let Some(name) = body.name {
        scene.name = name;
    }
    if let Some(room_id) = body.room_id {
        require_manage(&ctx, room_id.as_deref())?;
        scene.room_id = room_id;
    }
    if let Some(enabled) = body.enabled {
        scene.enabled = enabled;
    }
    if let Some(priority) = body.priority {
        if !(1..=100).contains(&priority) {
            return Err(Error::Validation(format!(
                "priority {priority} out of range 1-100"
            )));
        }
        scene.priority = priority;
    }
    if let Some(icon) = body.icon {
        scene.icon = icon;
    }
    if let Some(actions) = body.actions {
        scene.actions = materialize_actions(&scene.id, actions);
    }

    let updated = state.scenes.update(&scene).await?;
    state
        .audit
        .log(AuditRecord::new("update", "scene", &updated.id).by_user(&ctx.subject_id))
        .await;
    Ok(Json(updated))
}

/// DELETE /scenes/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let scene = state.scenes.get(&id).await?;
    require_manage(&ctx, scene.room_id.as_deref())?;
    state.scenes.delete(&scene.id).await?;
    state
        .audit
        .log(AuditRecord::new("delete", "scene", &scene.id).by_user(&ctx.subject_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /scenes/{id}/activate
pub async fn activate(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SceneActivate)?;
    let scene = state.scenes.get(&id).await?;
    ctx.scope.require(scene.room_id.as_deref())?;

    let summary = state
        .scene_engine
        .activate(&scene, Some(&ctx.subject_id))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}
