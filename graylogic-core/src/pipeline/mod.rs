//! Device-state fan-out pipeline
//!
//! The single path for inbound state: MQTT message → registry merge → TSDB
//! batch → state-history append → WebSocket broadcast. Each sink is
//! error-isolated; a TSDB outage never stops registry updates or broadcasts.

pub mod tsdb;

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::HistoryConfig;
use crate::error::{Error, Result};
use crate::mqtt::{state_filter, MessageHandler, MqttTransport, Topic};
use crate::registry::models::StateSource;
use crate::registry::{DeviceCache, HistoryStore};

pub use tsdb::TsdbWriter;

const PRUNE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

/// Event fanned out to WebSocket subscribers
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A device's state changed; `room_id` drives scope filtering
    StateChanged {
        device_id: String,
        room_id: Option<String>,
        state: serde_json::Map<String, serde_json::Value>,
    },
    /// A scene was activated
    SceneActivated {
        scene_id: String,
        room_id: Option<String>,
    },
}

/// The state pipeline
pub struct StatePipeline {
    cache: DeviceCache,
    history: HistoryStore,
    tsdb: Arc<TsdbWriter>,
    events: broadcast::Sender<PipelineEvent>,
    history_config: HistoryConfig,
    prune_task: Mutex<Option<JoinHandle<()>>>,
    subscribed_filters: Mutex<Vec<String>>,
}

impl StatePipeline {
    #[must_use]
    pub fn new(
        cache: DeviceCache,
        history: HistoryStore,
        tsdb: Arc<TsdbWriter>,
        history_config: HistoryConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            cache,
            history,
            tsdb,
            events,
            history_config,
            prune_task: Mutex::new(None),
            subscribed_filters: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to an event stream for WebSocket fan-out
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Publish a scene activation into the event stream
    pub fn announce_scene(&self, scene_id: &str, room_id: Option<String>) {
        let _ = self.events.send(PipelineEvent::SceneActivated {
            scene_id: scene_id.to_string(),
            room_id,
        });
    }

    /// Subscribe to the per-protocol state topics and start the prune loop
    pub async fn start(self: &Arc<Self>, mqtt: &Arc<MqttTransport>) -> Result<()> {
        for protocol in ["knx"] {
            let filter = state_filter(protocol);
            let pipeline = self.clone();
            let handler: Arc<dyn MessageHandler> = Arc::new(StateHandler { pipeline });
            mqtt.subscribe(filter.clone(), handler).await?;
            self.subscribed_filters.lock().await.push(filter);
        }

        let pipeline = self.clone();
        *self.prune_task.lock().await = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match pipeline
                    .history
                    .prune_state_history(pipeline.history_config.retention_days)
                    .await
                {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "state history pruned");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "state history prune failed"),
                }
            }
        }));
        Ok(())
    }

    /// Unsubscribe the state topics first, then stop the prune loop.
    ///
    /// The TSDB flush is left to the caller so the shutdown order
    /// (unsubscribe → pipeline stop → flush → HTTP → DB) stays explicit.
    pub async fn stop(&self, mqtt: &Arc<MqttTransport>) {
        for filter in self.subscribed_filters.lock().await.drain(..) {
            let _ = mqtt.unsubscribe(&filter).await;
        }
        if let Some(task) = self.prune_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("state pipeline stopped");
    }

    /// Process one inbound state message through every sink in order
    pub async fn handle_state(&self, device_key: &str, payload: &[u8]) -> Result<()> {
        // 1. Parse; unknown fields pass through untouched
        let parsed: StatePayload = serde_json::from_slice(payload)?;
        let state = parsed.state;
        if state.is_empty() {
            return Ok(());
        }

        let Some(device) = self.cache.get(device_key).await else {
            tracing::debug!(device = device_key, "state for unknown device ignored");
            return Ok(());
        };
        let now = Utc::now();

        // 2. Registry update; failure logs but does not abort the fan-out
        match self
            .cache
            .repository()
            .merge_device_state(&device.id, &state, now)
            .await
        {
            Ok(()) => self.cache.apply_state(&device.id, &state, now).await,
            Err(e) => {
                tracing::warn!(device = %device.id, error = %e, "registry state merge failed");
            }
        }

        // 3. TSDB batch append (never blocks; failures surface via on_error).
        // Tagged by slug, matching the topic scheme's device identifier.
        self.tsdb.append_state(&device.slug, &state).await;

        // 4. State history append; log-only on failure
        if let Err(e) = self
            .history
            .append_state(&device.id, &state, StateSource::Mqtt)
            .await
        {
            tracing::warn!(device = %device.id, error = %e, "state history append failed");
        }

        // 5. WebSocket broadcast
        let _ = self.events.send(PipelineEvent::StateChanged {
            device_id: device.id.clone(),
            room_id: device.room_id.clone(),
            state,
        });

        Ok(())
    }
}

struct StateHandler {
    pipeline: Arc<StatePipeline>,
}

#[async_trait::async_trait]
impl MessageHandler for StateHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let Topic::State { device_id, .. } = Topic::parse(topic)? else {
            return Err(Error::Validation(format!("not a state topic: {topic}")));
        };
        self.pipeline.handle_state(&device_id, payload).await
    }
}

#[derive(Debug, serde::Deserialize)]
struct StatePayload {
    #[serde(default)]
    state: serde_json::Map<String, serde_json::Value>,
}
