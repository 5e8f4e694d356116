//! System and location endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::audit::AuditRecord;
use crate::auth::Permission;
use crate::error::{Error, Result};
use crate::middleware::AuthContext;
use crate::state::AppState;

/// GET /health — liveness, no auth
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mqtt = state.mqtt.is_connected();
    Json(serde_json::json!({
        "status": if mqtt { "healthy" } else { "degraded" },
        "mqtt_connected": mqtt,
        "tsdb_dropped_records": state.tsdb.dropped_records(),
    }))
}

/// GET /site
pub async fn site(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    Ok(Json(state.cache.repository().get_site().await?))
}

#[derive(Debug, Deserialize)]
pub struct SetModeRequest {
    pub mode: String,
}

/// PUT /site/mode
pub async fn set_mode(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<SetModeRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SystemAdmin)?;
    state.cache.repository().set_site_mode(&body.mode).await?;
    state
        .audit
        .log(
            AuditRecord::new("set_mode", "site", &body.mode).by_user(&ctx.subject_id),
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /areas
pub async fn areas(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    Ok(Json(state.cache.repository().list_areas().await?))
}

/// GET /rooms — scoped callers see only their rooms
pub async fn rooms(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    let rooms = state.cache.repository().list_rooms().await?;
    let visible = ctx.scope.filter(rooms, |r| Some(r.id.clone()));
    Ok(Json(visible))
}

/// GET /zones
pub async fn zones(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    Ok(Json(state.cache.repository().list_zones().await?))
}

/// GET /groups
pub async fn groups(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    Ok(Json(state.cache.repository().list_groups().await?))
}

#[derive(Debug, Deserialize)]
pub struct MetricsProxyQuery {
    pub query: String,
}

/// GET /metrics — instant-query proxy (`system:admin`)
pub async fn metrics(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<MetricsProxyQuery>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SystemAdmin)?;
    Ok(Json(state.tsdb.query(&params.query).await?))
}

/// GET /discovery — passive KNX discovery tables (`system:admin`)
pub async fn discovery(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SystemAdmin)?;
    let individuals = state.history.discovered_individuals().await?;
    let groups = state.history.discovered_groups().await?;
    Ok(Json(serde_json::json!({
        "individual_addresses": individuals,
        "group_addresses": groups,
    })))
}

const FACTORY_RESET_CONFIRMATION: &str = "ERASE ALL DATA";

#[derive(Debug, Deserialize)]
pub struct FactoryResetRequest {
    pub confirmation: String,
}

/// POST /system/factory-reset (`system:dangerous` + confirmation string)
pub async fn factory_reset(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<FactoryResetRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::SystemDangerous)?;
    if body.confirmation != FACTORY_RESET_CONFIRMATION {
        return Err(Error::Validation(format!(
            "confirmation must be exactly '{FACTORY_RESET_CONFIRMATION}'"
        )));
    }

    state
        .audit
        .log(AuditRecord::new("factory_reset", "system", "all").by_user(&ctx.subject_id))
        .await;

    // Everything except users and the audit trail
    for table in [
        "state_history",
        "scene_executions",
        "scene_actions",
        "scenes",
        "device_tags",
        "device_groups",
        "devices",
        "panel_rooms",
        "panels",
        "knx_discovered_individuals",
        "knx_discovered_groups",
        "user_room_access",
        "rooms",
        "infrastructure_zones",
        "areas",
        "sites",
    ] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&state.pool)
            .await?;
    }
    state.cache.refresh().await?;
    if let Some(bridge) = &state.bridge {
        bridge.reload_devices().await?;
    }
    tracing::warn!(by = %ctx.subject_id, "factory reset executed");
    Ok(StatusCode::NO_CONTENT)
}
