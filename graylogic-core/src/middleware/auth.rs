//! Authentication and scope-resolution middleware
//!
//! Accepts either a Bearer access token (users, panels via login) or an
//! `X-Panel-Token` header (panel device identity). On success an
//! [`AuthContext`] with the materialized room scope lands in request
//! extensions; permission checks happen per-route via [`AuthContext::require`].

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::auth::{role_has, Permission, Role, RoomScope};
use crate::error::{Error, Result};
use crate::state::AppState;

/// The authenticated caller, attached to request extensions
#[derive(Clone)]
pub struct AuthContext {
    /// User id or panel id
    pub subject_id: String,
    pub role: Role,
    pub scope: RoomScope,
    /// True for panel-token callers and panel-audience JWTs
    pub is_panel: bool,
}

impl AuthContext {
    /// 403 unless the caller's role holds the permission
    pub fn require(&self, permission: Permission) -> Result<()> {
        if role_has(self.role, permission) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "requires {}",
                permission.as_str()
            )))
        }
    }
}

/// Authenticate the request and resolve its room scope
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let headers = request.headers();

    let context = if let Some(token) = headers
        .get("x-panel-token")
        .and_then(|v| v.to_str().ok())
    {
        let panel = state.auth.panels.authenticate(token).await?;
        AuthContext {
            subject_id: panel.panel_id.clone(),
            role: Role::Panel,
            scope: RoomScope::from_panel(&panel),
            is_panel: true,
        }
    } else if let Some(bearer) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        let claims = state.auth.tokens.verify(bearer)?;
        let role = claims.role()?;
        if claims.is_panel() {
            // Panel-audience JWT: scope comes from the panel's room set
            let panel = state.auth.panels.get(&claims.sub).await.map_err(|_| {
                Error::Unauthenticated("panel no longer exists".to_string())
            })?;
            if !panel.is_active {
                return Err(Error::Unauthenticated("panel disabled".to_string()));
            }
            AuthContext {
                subject_id: claims.sub.clone(),
                role: Role::Panel,
                scope: RoomScope::Rooms {
                    room_ids: panel.room_ids.clone(),
                    can_manage_scenes: Default::default(),
                },
                is_panel: true,
            }
        } else {
            let user = state.auth.users.get(&claims.sub).await.map_err(|_| {
                Error::Unauthenticated("user no longer exists".to_string())
            })?;
            if !user.is_active {
                return Err(Error::Unauthenticated("account disabled".to_string()));
            }
            // The token's role claim is advisory; the registry row is
            // authoritative after role changes.
            let scope = state.auth.scope_for_user(&user).await?;
            AuthContext {
                subject_id: user.id.clone(),
                role: user.role,
                scope,
                is_panel: false,
            }
        }
    } else {
        return Err(Error::Unauthenticated("missing credentials".to_string()));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
