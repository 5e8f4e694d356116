//! User management endpoints (`users:manage`)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::audit::AuditRecord;
use crate::auth::{Permission, Role, RoomGrant};
use crate::error::{Error, Result};
use crate::middleware::AuthContext;
use crate::state::AppState;

/// GET /users
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    Ok(Json(state.auth.users.list().await?))
}

/// GET /users/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    Ok(Json(state.auth.users.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
    pub role: Role,
}

/// POST /users
pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateUserRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    // Only the owner may mint admins or another owner
    if body.role >= Role::Admin && ctx.role != Role::Owner {
        return Err(Error::Forbidden(
            "only the owner can create admin accounts".to_string(),
        ));
    }
    let hash = state.auth.hash_password(&body.password).await?;
    let user = state
        .auth
        .users
        .create(
            &body.username,
            &body.display_name,
            body.email.as_deref(),
            &hash,
            body.role,
            Some(&ctx.subject_id),
        )
        .await?;
    state
        .audit
        .log(AuditRecord::new("create", "user", &user.id).by_user(&ctx.subject_id))
        .await;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
pub struct PatchUserRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<Option<String>>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// PATCH /users/{id}
pub async fn patch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PatchUserRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    let target = state.auth.users.get(&id).await?;
    if target.role == Role::Owner && ctx.subject_id != target.id {
        return Err(Error::Forbidden("the owner account is immutable".to_string()));
    }
    if let Some(role) = body.role {
        if role >= Role::Admin && ctx.role != Role::Owner {
            return Err(Error::Forbidden(
                "only the owner can grant admin".to_string(),
            ));
        }
    }
    let user = state
        .auth
        .users
        .update(
            &id,
            body.display_name.as_deref(),
            body.email.as_ref().map(|e| e.as_deref()),
            body.role,
            body.is_active,
        )
        .await?;
    state
        .audit
        .log(AuditRecord::new("update", "user", &user.id).by_user(&ctx.subject_id))
        .await;
    Ok(Json(user))
}

/// DELETE /users/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    let target = state.auth.users.get(&id).await?;
    if target.role == Role::Owner {
        return Err(Error::Forbidden("the owner account cannot be deleted".to_string()));
    }
    if target.id == ctx.subject_id {
        return Err(Error::Conflict("cannot delete your own account".to_string()));
    }
    state.auth.users.delete(&id).await?;
    state
        .audit
        .log(AuditRecord::new("delete", "user", &id).by_user(&ctx.subject_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /users/{id}/rooms
pub async fn rooms(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    Ok(Json(state.auth.users.room_grants(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub room_id: String,
    #[serde(default)]
    pub can_manage_scenes: bool,
}

/// PUT /users/{id}/rooms — replace the full grant set
pub async fn replace_rooms(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<Vec<GrantRequest>>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    let target = state.auth.users.get(&id).await?;
    let grants: Vec<RoomGrant> = body
        .into_iter()
        .map(|g| RoomGrant {
            room_id: g.room_id,
            can_manage_scenes: g.can_manage_scenes,
        })
        .collect();
    state.auth.users.replace_room_grants(&target.id, &grants).await?;
    state
        .audit
        .log(
            AuditRecord::new("update", "user_room_access", &target.id)
                .by_user(&ctx.subject_id)
                .with_details(serde_json::json!({ "rooms": grants.len() })),
        )
        .await;
    Ok(Json(state.auth.users.room_grants(&target.id).await?))
}

/// GET /users/{id}/sessions
pub async fn sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    Ok(Json(state.auth.refresh.sessions_for_user(&id).await?))
}

/// DELETE /users/{id}/sessions — sign the user out everywhere
pub async fn revoke_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::UsersManage)?;
    let revoked = state.auth.refresh.revoke_all_for_user(&id).await?;
    state
        .audit
        .log(
            AuditRecord::new("revoke_sessions", "user", &id)
                .by_user(&ctx.subject_id)
                .with_details(serde_json::json!({ "revoked": revoked })),
        )
        .await;
    Ok(Json(serde_json::json!({ "revoked": revoked })))
}
