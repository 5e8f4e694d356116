//! KNX ↔ MQTT protocol bridge
//!
//! Translates inbound MQTT commands into bus telegrams and bus traffic into
//! MQTT state snapshots. Holds the GA↔device mapping tables, rebuilt
//! clear-first on every registry reload, and feeds the passive-discovery
//! tables from every observed telegram.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::KnxConfig;
use crate::error::{Error, Result};
use crate::knx::address::GroupAddress;
use crate::knx::dpt::{self, Dpt, DptValue};
use crate::knx::functions;
use crate::knx::telegram::{Apci, Telegram};
use crate::mqtt::{topics, MessageHandler, MqttTransport, Topic};
use crate::registry::{DeviceCache, HistoryStore};

const PROTOCOL: &str = "knx";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Mapping tables derived from the device registry.
///
/// Rebuilt wholesale under the writer lock; appending without clearing would
/// leak removed devices.
#[derive(Default)]
struct BridgeMaps {
    ga_to_device: HashMap<GroupAddress, String>,
    ga_to_function: HashMap<GroupAddress, String>,
    device_to_gas: HashMap<String, Vec<GroupAddress>>,
}

/// The KNX protocol bridge
pub struct KnxBridge {
    config: KnxConfig,
    cache: DeviceCache,
    history: HistoryStore,
    mqtt: Arc<MqttTransport>,
    maps: Arc<RwLock<BridgeMaps>>,
    daemon_writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    daemon_up: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl KnxBridge {
    #[must_use]
    pub fn new(
        config: KnxConfig,
        cache: DeviceCache,
        history: HistoryStore,
        mqtt: Arc<MqttTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache,
            history,
            mqtt,
            maps: Arc::new(RwLock::new(BridgeMaps::default())),
            daemon_writer: Arc::new(Mutex::new(None)),
            daemon_up: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Build the mapping tables, subscribe to command topics, and start the
    /// daemon-socket and heartbeat loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload_devices().await?;

        let bridge = self.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(CommandHandler { bridge });
        self.mqtt
            .subscribe(topics::command_filter(PROTOCOL), handler)
            .await?;

        let mut tasks = self.tasks.lock().await;
        let bridge = self.clone();
        tasks.push(tokio::spawn(async move {
            bridge.daemon_loop().await;
        }));
        let bridge = self.clone();
        tasks.push(tokio::spawn(async move {
            bridge.heartbeat_loop().await;
        }));
        Ok(())
    }

    /// Unsubscribe, publish an offline heartbeat, and join the loops
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.mqtt.unsubscribe(&topics::command_filter(PROTOCOL)).await;

        if let Ok(topic) = Topic::health(PROTOCOL) {
            let payload = health_payload("offline");
            let _ = self.mqtt.publish_retained(&topic, payload).await;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("knx bridge stopped");
    }

    /// Rebuild the GA maps from the registry.
    ///
    /// The previous tables are discarded entirely so devices removed from the
    /// registry cannot leave stale residues.
    pub async fn reload_devices(&self) -> Result<()> {
        let devices = self.cache.all().await;
        let mut next = BridgeMaps::default();

        for device in &devices {
            if device.protocol != crate::registry::models::Protocol::Knx {
                continue;
            }
            for (function_name, function) in &device.functions {
                let ga = function.group_address;
                next.ga_to_device.insert(ga, device.id.clone());
                next.ga_to_function.insert(ga, function_name.clone());
                next.device_to_gas
                    .entry(device.id.clone())
                    .or_default()
                    .push(ga);
            }
        }

        let mut maps = self.maps.write().await;
        *maps = next;
        tracing::info!(
            devices = maps.device_to_gas.len(),
            group_addresses = maps.ga_to_device.len(),
            "knx bridge maps rebuilt"
        );
        Ok(())
    }

    /// Group addresses currently mapped for a device (test/introspection)
    pub async fn device_addresses(&self, device_id: &str) -> Vec<GroupAddress> {
        self.maps
            .read()
            .await
            .device_to_gas
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolve `(ga, function)` for a device id or slug (test/introspection)
    pub async fn lookup_ga(&self, ga: GroupAddress) -> Option<(String, String)> {
        let maps = self.maps.read().await;
        let device = maps.ga_to_device.get(&ga)?.clone();
        let function = maps.ga_to_function.get(&ga)?.clone();
        Some((device, function))
    }

    // ------------------------------------------------------------------
    // Command path
    // ------------------------------------------------------------------

    /// Handle an inbound MQTT command: resolve, encode, write to the daemon.
    ///
    /// State topics are never emitted from here; confirmation comes from the
    /// bus or not at all.
    pub async fn handle_command(&self, device_id: &str, payload: &[u8]) -> Result<()> {
        let command: CommandPayload = serde_json::from_slice(payload)?;
        let device = self
            .cache
            .get(device_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("device '{device_id}'")))?;

        let (function_name, value) = resolve_command(&device, &command)?;
        let function = device.functions.get(&function_name).ok_or_else(|| {
            Error::Validation(format!(
                "device '{device_id}' has no '{function_name}' function"
            ))
        })?;

        let dpt = resolve_dpt(function.dpt, &function_name)?;
        let bytes = dpt::encode(dpt, &value)?;
        let telegram = Telegram::write(function.group_address, bytes);

        self.send_telegram(&telegram).await?;
        tracing::debug!(
            device = device_id,
            function = %function_name,
            ga = %function.group_address,
            "command written to bus"
        );
        Ok(())
    }

    /// Issue a read request on a group address (canary probe support)
    pub async fn handle_canary_read(&self, ga: GroupAddress) -> Result<()> {
        self.send_telegram(&Telegram::read(ga)).await
    }

    async fn send_telegram(&self, telegram: &Telegram) -> Result<()> {
        let frame = telegram.encode()?;
        let mut writer = self.daemon_writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::NotConnected("knx daemon socket".to_string()));
        };
        writer
            .write_all(&frame)
            .await
            .map_err(|e| Error::WriteFailed(format!("knx daemon write: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bus traffic
    // ------------------------------------------------------------------

    /// Translate an observed telegram into a state publication.
    ///
    /// Returns the topic and payload when the telegram maps to a device
    /// function; passive discovery is updated for every telegram either way.
    pub async fn handle_telegram(&self, telegram: &Telegram) -> Result<Option<(Topic, Vec<u8>)>> {
        // Passive discovery runs synchronously so it cannot race a reload
        let now = Utc::now();
        if telegram.source.raw() != 0 {
            if let Err(e) = self
                .history
                .touch_individual(&telegram.source.to_string(), now)
                .await
            {
                tracing::debug!(error = %e, "discovery individual update failed");
            }
        }
        let saw_response = telegram.apci == Apci::GroupValueResponse;
        if let Err(e) = self
            .history
            .touch_group(&telegram.destination.to_string(), now, saw_response)
            .await
        {
            tracing::debug!(error = %e, "discovery group update failed");
        }

        // Reads carry no value
        if telegram.apci == Apci::GroupValueRead {
            return Ok(None);
        }

        let Some((device_id, function_name)) = self.lookup_ga(telegram.destination).await else {
            return Ok(None);
        };

        let device = self
            .cache
            .get(&device_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("device '{device_id}'")))?;
        let stored_dpt = device
            .functions
            .get(&function_name)
            .and_then(|f| f.dpt);
        let dpt = resolve_dpt(stored_dpt, &function_name)?;

        let value = match dpt::decode(dpt, &telegram.payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    ga = %telegram.destination,
                    raw = %hex_string(&telegram.payload),
                    error = %e,
                    "telegram decode failed"
                );
                return Ok(None);
            }
        };

        let device_slug = device.slug.clone();
        let mut state = serde_json::Map::new();
        state.insert(state_key(&function_name), value.to_json());
        let body = serde_json::json!({ "state": state });

        let topic = Topic::state(PROTOCOL, &device_slug)?;
        Ok(Some((topic, serde_json::to_vec(&body)?)))
    }

    async fn daemon_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_millis(500);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match UnixStream::connect(&self.config.daemon_socket).await {
                Ok(stream) => {
                    tracing::info!(socket = %self.config.daemon_socket.display(), "connected to knx daemon");
                    self.daemon_up.store(true, Ordering::SeqCst);
                    backoff = Duration::from_millis(500);

                    let (mut reader, writer) = stream.into_split();
                    *self.daemon_writer.lock().await = Some(writer);

                    loop {
                        let mut len_buf = [0u8; 2];
                        if reader.read_exact(&mut len_buf).await.is_err() {
                            break;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        if len == 0 || len > 4096 {
                            tracing::warn!(len, "implausible frame length from daemon");
                            break;
                        }
                        let mut body = vec![0u8; len];
                        if reader.read_exact(&mut body).await.is_err() {
                            break;
                        }

                        match Telegram::decode(&body) {
                            Ok(telegram) => match self.handle_telegram(&telegram).await {
                                Ok(Some((topic, payload))) => {
                                    if let Err(e) = self.mqtt.publish(&topic, payload).await {
                                        tracing::warn!(error = %e, "state publish failed");
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "telegram handling failed");
                                }
                            },
                            Err(e) => {
                                tracing::warn!(
                                    raw = %hex_string(&body),
                                    error = %e,
                                    "undecodable frame from daemon"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "knx daemon socket connect failed");
                }
            }

            // Disconnected: surface degraded health and retry
            let was_up = self.daemon_up.swap(false, Ordering::SeqCst);
            *self.daemon_writer.lock().await = None;
            if was_up {
                self.mark_devices_degraded().await;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    /// On daemon loss every mapped device's health turns degraded; the next
    /// state message flips it back to online.
    async fn mark_devices_degraded(&self) {
        let device_ids: Vec<String> = {
            let maps = self.maps.read().await;
            maps.device_to_gas.keys().cloned().collect()
        };
        for device_id in device_ids {
            if let Err(e) = self
                .cache
                .repository()
                .set_device_health(&device_id, crate::registry::models::HealthStatus::Degraded)
                .await
            {
                tracing::debug!(device = %device_id, error = %e, "health downgrade failed");
            }
        }
        if let Err(e) = self.cache.refresh().await {
            tracing::debug!(error = %e, "cache refresh after health downgrade failed");
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let Ok(topic) = Topic::health(PROTOCOL) else {
            return;
        };
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let status = if self.daemon_up.load(Ordering::SeqCst) {
                "healthy"
            } else {
                "degraded"
            };
            if let Err(e) = self
                .mqtt
                .publish_retained(&topic, health_payload(status))
                .await
            {
                tracing::debug!(error = %e, "bridge heartbeat publish failed");
            }
        }
    }
}

struct CommandHandler {
    bridge: Arc<KnxBridge>,
}

#[async_trait::async_trait]
impl MessageHandler for CommandHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let Topic::Command { device_id, .. } = Topic::parse(topic)? else {
            return Err(Error::Validation(format!("not a command topic: {topic}")));
        };
        self.bridge.handle_command(&device_id, payload).await
    }
}

#[derive(Debug, serde::Deserialize)]
struct CommandPayload {
    command: String,
    #[serde(default)]
    parameters: serde_json::Map<String, serde_json::Value>,
}

/// Map a command name to a device function and value.
///
/// Well-known commands ("on", "off", "dim", ...) translate to their canonical
/// function; anything else must name a function the device carries.
fn resolve_command(
    device: &crate::registry::models::Device,
    command: &CommandPayload,
) -> Result<(String, DptValue)> {
    let name = command.command.as_str();
    let parameters = &command.parameters;

    let level_param = |key: &str| {
        parameters
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| Error::Validation(format!("command '{name}' requires '{key}'")))
    };

    match name {
        "on" => Ok(("switch".to_string(), DptValue::Bool(true))),
        "off" => Ok(("switch".to_string(), DptValue::Bool(false))),
        "toggle" => {
            let current = device
                .state
                .get("on")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            Ok(("switch".to_string(), DptValue::Bool(!current)))
        }
        "dim" | "set_level" => Ok(("brightness".to_string(), DptValue::Percent(level_param("level")?))),
        "set_position" => Ok(("position".to_string(), DptValue::Percent(level_param("position")?))),
        "stop" => Ok((
            "dimming".to_string(),
            DptValue::Control { control: false, step: 0 },
        )),
        "set_temperature" => Ok(("setpoint".to_string(), DptValue::Float(level_param("temperature")?))),
        "set_hvac_mode" => Ok((
            "hvac_mode".to_string(),
            DptValue::HvacMode(level_param("mode")? as u8),
        )),
        "scene" => Ok((
            "scene".to_string(),
            DptValue::Scene(level_param("scene")? as u8),
        )),
        other => {
            let function_name = functions::normalize(other);
            if !device.functions.contains_key(&function_name) {
                return Err(Error::Validation(format!(
                    "unknown command '{other}' for device '{}'",
                    device.slug
                )));
            }
            let value = parameters
                .get("value")
                .ok_or_else(|| Error::Validation(format!("command '{other}' requires 'value'")))?;
            let dpt = resolve_dpt(
                device.functions[&function_name].dpt,
                &function_name,
            )?;
            Ok((function_name, DptValue::from_json(dpt, value)?))
        }
    }
}

/// DPT preference order: stored on the device, then the canonical registry,
/// then the name heuristic.
fn resolve_dpt(stored: Option<Dpt>, function_name: &str) -> Result<Dpt> {
    if let Some(dpt) = stored {
        return Ok(dpt);
    }
    if let Some(defaults) = functions::lookup(function_name) {
        return Ok(defaults.dpt);
    }
    functions::guess_dpt(function_name).ok_or_else(|| {
        Error::Validation(format!("no DPT known for function '{function_name}'"))
    })
}

/// State key a function reports under: status functions report their base key
fn state_key(function_name: &str) -> String {
    let base = function_name.strip_suffix("_status").unwrap_or(function_name);
    match base {
        "switch" => "on".to_string(),
        "brightness" => "level".to_string(),
        other => other.to_string(),
    }
}

fn health_payload(status: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "status": status,
        "ts": Utc::now().to_rfc3339(),
    }))
    .unwrap_or_default()
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
