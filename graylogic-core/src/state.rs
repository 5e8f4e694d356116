//! Application state shared across handlers

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::auth::{AuthService, RateLimiter};
use crate::config::Config;
use crate::knx::KnxBridge;
use crate::mqtt::MqttTransport;
use crate::pipeline::{StatePipeline, TsdbWriter};
use crate::registry::{DeviceCache, HistoryStore, SceneStore};
use crate::scene_engine::SceneEngine;

/// Shared state handed to every handler.
///
/// Everything inside is cheaply cloneable (pools and `Arc`s).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub cache: DeviceCache,
    pub history: HistoryStore,
    pub scenes: SceneStore,
    pub auth: AuthService,
    pub rate_limiter: Arc<RateLimiter>,
    pub tsdb: Arc<TsdbWriter>,
    pub pipeline: Arc<StatePipeline>,
    pub mqtt: Arc<MqttTransport>,
    pub scene_engine: SceneEngine,
    pub audit: AuditLogger,
    /// Present when the KNX bridge is enabled
    pub bridge: Option<Arc<KnxBridge>>,
    /// Root shutdown token; cancelled once ingest has stopped so long-lived
    /// connections (WebSockets) drain together with the HTTP listener
    pub shutdown: CancellationToken,
}
