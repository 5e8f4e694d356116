//! Device endpoints
//!
//! Every list and fetch applies room-scope filtering before anything leaves
//! the handler; a device outside the caller's scope is indistinguishable
//! from a missing one only in the list case — direct access is an explicit
//! 403 per the scope contract.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::auth::Permission;
use crate::error::{Error, Result};
use crate::middleware::AuthContext;
use crate::mqtt::Topic;
use crate::registry::models::{
    Device, DeviceFunction, DeviceType, Domain, HealthStatus, Protocol,
};
use crate::state::AppState;

/// GET /devices
pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    let devices = state.cache.all().await;
    let visible = ctx.scope.filter(devices, |d| d.room_id.clone());
    Ok(Json(visible))
}

/// GET /devices/{id}
pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    let device = state
        .cache
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
    ctx.scope.require(device.room_id.as_deref())?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceRequest {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    pub device_type: DeviceType,
    pub domain: Domain,
    pub protocol: Protocol,
    #[serde(default)]
    pub functions: HashMap<String, DeviceFunction>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// POST /devices
pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateDeviceRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceConfigure)?;
    let device = Device {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        slug: body.slug,
        room_id: body.room_id,
        area_id: body.area_id,
        device_type: body.device_type,
        domain: body.domain,
        protocol: body.protocol,
        functions: body.functions,
        capabilities: body.capabilities,
        config: body.config,
        state: serde_json::Map::new(),
        state_updated_at: None,
        health: HealthStatus::Unknown,
        last_seen: None,
        tags: body.tags,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let created = state.cache.repository().create_device(&device).await?;
    state.cache.refresh().await?;
    if let Some(bridge) = &state.bridge {
        bridge.reload_devices().await?;
    }

    state
        .audit
        .log(AuditRecord::new("create", "device", &created.id).by_user(&ctx.subject_id))
        .await;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct PatchDeviceRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub room_id: Option<Option<String>>,
    #[serde(default)]
    pub area_id: Option<Option<String>>,
    #[serde(default)]
    pub functions: Option<HashMap<String, DeviceFunction>>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default)]
    pub config: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// PATCH /devices/{id}
pub async fn patch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<PatchDeviceRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceConfigure)?;
    let mut device = state.cache.repository().get_device(&id).await?;

    if let Some(name) = body.name {
        device.name = name;
    }
    if let Some(room_id) = body.room_id {
        device.room_id = room_id;
    }
    if let Some(area_id) = body.area_id {
        device.area_id = area_id;
    }
    if let Some(functions) = body.functions {
        device.functions = functions;
    }
    if let Some(capabilities) = body.capabilities {
        device.capabilities = capabilities;
    }
    if let Some(config) = body.config {
        device.config = config;
    }
    if let Some(tags) = body.tags {
        device.tags = tags;
    }

    let updated = state.cache.repository().update_device(&device).await?;
    state.cache.refresh().await?;
    if let Some(bridge) = &state.bridge {
        bridge.reload_devices().await?;
    }

    state
        .audit
        .log(AuditRecord::new("update", "device", &updated.id).by_user(&ctx.subject_id))
        .await;
    Ok(Json(updated))
}

/// DELETE /devices/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceConfigure)?;
    let device = state.cache.repository().get_device(&id).await?;
    state.cache.repository().delete_device(&device.id).await?;
    state.cache.refresh().await?;
    if let Some(bridge) = &state.bridge {
        bridge.reload_devices().await?;
    }

    state
        .audit
        .log(AuditRecord::new("delete", "device", &device.id).by_user(&ctx.subject_id))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// PUT /devices/{id}/state — dispatch a command.
///
/// Returns 202: the command is on its way to the bus; the state update
/// arrives asynchronously when the device confirms.
pub async fn put_state(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<CommandRequest>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceWrite)?;
    let device = state
        .cache
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
    ctx.scope.require(device.room_id.as_deref())?;

    let topic = Topic::command(device.protocol.as_str(), &device.slug)?;
    let payload = serde_json::json!({
        "command": body.command,
        "parameters": body.parameters,
    });
    state.mqtt.publish(&topic, serde_json::to_vec(&payload)?).await?;

    state
        .audit
        .log(
            AuditRecord::new("command", "device", &device.id)
                .by_user(&ctx.subject_id)
                .with_details(serde_json::json!({ "command": body.command })),
        )
        .await;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "dispatched": true }))))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    100
}

/// GET /devices/{id}/history
pub async fn history(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    let device = state
        .cache
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
    ctx.scope.require(device.room_id.as_deref())?;

    let entries = state.history.device_history(&device.id, query.limit).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub measurement: String,
    pub start: String,
    pub end: String,
    #[serde(default = "default_step")]
    pub step: String,
}

fn default_step() -> String {
    "60s".to_string()
}

/// GET /devices/{id}/metrics — range query proxied to the TSDB
pub async fn metrics(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<MetricsQuery>,
) -> Result<impl IntoResponse> {
    ctx.require(Permission::DeviceRead)?;
    let device = state
        .cache
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("device '{id}'")))?;
    ctx.scope.require(device.room_id.as_deref())?;

    let promql = format!(
        "device_metrics{{device_id=\"{}\",measurement=\"{}\"}}",
        device.slug, query.measurement
    );
    let result = state
        .tsdb
        .query_range(&promql, &query.start, &query.end, &query.step)
        .await?;
    Ok(Json(result))
}
