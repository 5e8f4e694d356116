//! Server assembly and lifecycle
//!
//! Builds every component, wires the pipeline, serves HTTP, and tears down
//! in the order that preserves the last seconds of telemetry: bridge and
//! state subscriptions first, then the pipeline, then the TSDB flush, then
//! the HTTP listener, and the database last. A root cancellation token
//! propagates the shutdown to every long-lived connection, so an idle
//! WebSocket client cannot hold the drain open.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::audit::{AuditLogger, AuditWriter};
use crate::auth::{AuthService, RateLimiter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::knx::{BridgeCanary, DaemonSupervisor, KnxBridge};
use crate::mqtt::{MqttTransport, Topic};
use crate::pipeline::{StatePipeline, TsdbWriter};
use crate::registry::{db, DeviceCache, HistoryStore, SceneStore};
use crate::registry::repository::Repository;
use crate::scene_engine::SceneEngine;
use crate::state::AppState;

/// Initialize the tracing subscriber from the configured filter
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    fmt().with_env_filter(filter).init();
}

/// A fully built core, ready to serve
pub struct GrayLogicCore {
    state: AppState,
    audit_writer: AuditWriter,
    supervisor: Option<Arc<DaemonSupervisor>>,
    heartbeat_task: tokio::task::JoinHandle<()>,
    maintenance_task: tokio::task::JoinHandle<()>,
}

impl GrayLogicCore {
    /// Construct every component and start the background machinery
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = db::connect(&config.database).await?;
        let repository = Repository::new(pool.clone());
        let cache = DeviceCache::new(repository);
        cache.refresh().await?;
        let history = HistoryStore::new(pool.clone());
        let scenes = SceneStore::new(pool.clone());

        let (audit, audit_writer) = AuditLogger::start(pool.clone());
        let auth = AuthService::new(pool.clone(), &config.auth, audit.clone())?;
        auth.seed_owner_if_empty().await?;

        let mqtt = MqttTransport::connect(&config.mqtt).await?;
        let tsdb = TsdbWriter::new(config.tsdb.clone());
        tsdb.set_on_error(Arc::new(|error| {
            tracing::warn!(error = %error, "tsdb write failure");
        }))
        .await;
        tsdb.start().await;

        let pipeline = StatePipeline::new(
            cache.clone(),
            history.clone(),
            tsdb.clone(),
            config.history.clone(),
        );
        pipeline.start(&mqtt).await?;

        let scene_engine = SceneEngine::new(
            cache.clone(),
            history.clone(),
            mqtt.clone(),
            pipeline.clone(),
            audit.clone(),
        );

        // KNX: supervisor owns the daemon, bridge owns the translation
        let (bridge, supervisor) = if config.knx.enabled {
            let bridge = KnxBridge::new(
                config.knx.clone(),
                cache.clone(),
                history.clone(),
                mqtt.clone(),
            );
            bridge.start().await?;

            let supervisor = DaemonSupervisor::new(config.knx.clone());
            if let Some(canary) = &config.knx.canary_group_address {
                match canary.parse() {
                    Ok(ga) => {
                        supervisor
                            .set_canary(Arc::new(BridgeCanary::new(
                                bridge.clone(),
                                history.clone(),
                                ga,
                            )))
                            .await;
                    }
                    Err(e) => {
                        return Err(Error::ConfigInvalid(format!(
                            "knx.canary_group_address: {e}"
                        )))
                    }
                }
            }
            supervisor.start().await?;
            (Some(bridge), Some(supervisor))
        } else {
            (None, None)
        };

        // Daily maintenance: expired refresh tokens, burned tickets, stale
        // rate-limit windows
        let maintenance_auth = auth.clone();
        let maintenance_limiter = Arc::new(RateLimiter::new());
        let rate_limiter = maintenance_limiter.clone();
        let maintenance_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                match maintenance_auth.refresh.cleanup_expired().await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "expired refresh tokens cleaned up");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "refresh cleanup failed"),
                }
                if let Err(e) = maintenance_auth.tickets.cleanup().await {
                    tracing::warn!(error = %e, "ticket cleanup failed");
                }
                maintenance_limiter.prune();
            }
        });

        // Retained core heartbeat; the LWT flips it to offline if we die
        let heartbeat_mqtt = mqtt.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let payload = serde_json::json!({
                    "status": "healthy",
                    "ts": chrono::Utc::now().to_rfc3339(),
                });
                let _ = heartbeat_mqtt
                    .publish_retained(
                        &Topic::CoreHealth,
                        serde_json::to_vec(&payload).unwrap_or_default(),
                    )
                    .await;
            }
        });

        let state = AppState {
            config,
            pool,
            cache,
            history,
            scenes,
            auth,
            rate_limiter,
            tsdb,
            pipeline,
            mqtt,
            scene_engine,
            audit,
            bridge,
            shutdown: CancellationToken::new(),
        };

        Ok(Self {
            state,
            audit_writer,
            supervisor,
            heartbeat_task,
            maintenance_task,
        })
    }

    /// Shared state (for tests and embedding)
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until SIGINT/SIGTERM, then tear down in order.
    ///
    /// The signal does not go straight to the HTTP drain: ingest stops
    /// first (bridge and state subscriptions, then the pipeline, then the
    /// TSDB flush), and only then is the root token cancelled, which closes
    /// the listener and every WebSocket connection together. The remaining
    /// components and the database follow once the drain completes.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        )
        .parse()
        .map_err(|e| Error::ConfigInvalid(format!("server address: {e}")))?;

        let app = api::router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("bind {addr}: {e}")))?;
        tracing::info!(%addr, "http server listening");

        let shutdown = self.state.shutdown.clone();
        let serve_task = tokio::spawn(
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
        );

        shutdown_signal().await;

        self.stop_ingest().await;
        shutdown.cancel();
        match serve_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "http server error during drain"),
            Err(e) => tracing::error!(error = %e, "http server task failed"),
        }

        self.finish_teardown().await;
        Ok(())
    }

    /// Full teardown for embedders that did not go through [`run`].
    ///
    /// [`run`]: GrayLogicCore::run
    pub async fn teardown(self) {
        self.stop_ingest().await;
        self.state.shutdown.cancel();
        self.finish_teardown().await;
    }

    /// Phase one: stop feeding the sinks.
    ///
    /// Bridge and state subscriptions go first so no message arrives
    /// half-way through sink shutdown, then the pipeline, then the TSDB
    /// flush — all before the HTTP surface closes.
    async fn stop_ingest(&self) {
        tracing::info!("shutdown: stopping ingest");

        if let Some(bridge) = &self.state.bridge {
            bridge.stop().await;
        }
        self.state.pipeline.stop(&self.state.mqtt).await;
        self.state.tsdb.stop().await;
    }

    /// Phase two, after the HTTP drain: background tasks, daemon, audit,
    /// transport, and the database last so every sink could still write.
    async fn finish_teardown(self) {
        self.heartbeat_task.abort();
        let _ = self.heartbeat_task.await;
        self.maintenance_task.abort();
        let _ = self.maintenance_task.await;

        if let Some(supervisor) = &self.supervisor {
            supervisor.stop().await;
        }
        self.audit_writer.stop().await;
        self.state.mqtt.stop().await;
        self.state.pool.close().await;
        tracing::info!("shutdown complete");
    }
}

/// Wait for SIGTERM or SIGINT
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, draining"),
        () = terminate => tracing::info!("received SIGTERM, draining"),
    }
}
