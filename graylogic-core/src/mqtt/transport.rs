//! MQTT transport with automatic reconnect and subscription replay
//!
//! Wraps a single `rumqttc` client. Subscriptions are recorded so that on
//! every reconnect they are re-issued before "connected" is signalled to
//! consumers. The client advertises a retained last-will on
//! `graylogic/health/core` so the broker announces our death.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Packet, QoS,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::error::{Error, Result};
use crate::mqtt::topics::{filter_matches, Topic};

/// Handler for inbound messages on a subscribed filter.
///
/// A handler returning an error is logged and otherwise ignored; errors never
/// propagate to the broker. The handler for a given filter is immutable —
/// replacing it requires unsubscribe + subscribe.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

#[derive(Clone)]
struct Subscription {
    qos: QoS,
    handler: Arc<dyn MessageHandler>,
}

/// MQTT transport shared by the bridge and the state pipeline
pub struct MqttTransport {
    client: AsyncClient,
    subscriptions: Arc<RwLock<HashMap<String, Subscription>>>,
    connected_rx: watch::Receiver<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the broker and start the event loop task.
    ///
    /// Returns once the background task is running; use [`wait_connected`]
    /// to block until the session is established.
    ///
    /// [`wait_connected`]: MqttTransport::wait_connected
    pub async fn connect(config: &MqttConfig) -> Result<Arc<Self>> {
        let mut options =
            MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        // Broker announces us offline if the session drops without a disconnect
        let lwt_payload = serde_json::json!({ "status": "offline" }).to_string();
        options.set_last_will(LastWill::new(
            Topic::CoreHealth.to_string(),
            lwt_payload,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let subscriptions: Arc<RwLock<HashMap<String, Subscription>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let transport = Arc::new(Self {
            client: client.clone(),
            subscriptions: subscriptions.clone(),
            connected_rx,
            event_task: Mutex::new(None),
        });

        let task = tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // Replay every recorded subscription before consumers
                        // observe the connected state.
                        let subs = subscriptions.read().await;
                        let mut replay_ok = true;
                        for (filter, sub) in subs.iter() {
                            if let Err(e) = client.subscribe(filter.clone(), sub.qos).await {
                                tracing::warn!(filter = %filter, error = %e, "subscription replay failed");
                                replay_ok = false;
                            }
                        }
                        drop(subs);
                        if replay_ok {
                            backoff = Duration::from_millis(500);
                            let _ = connected_tx.send(true);
                            tracing::info!("mqtt session established");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload = publish.payload.to_vec();
                        let handler = {
                            let subs = subscriptions.read().await;
                            subs.iter()
                                .find(|(filter, _)| filter_matches(filter, &topic))
                                .map(|(_, sub)| sub.handler.clone())
                        };
                        match handler {
                            Some(handler) => {
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle(&topic, &payload).await {
                                        tracing::warn!(topic = %topic, error = %e, "message handler failed");
                                    }
                                });
                            }
                            None => {
                                tracing::debug!(topic = %topic, "no handler for inbound message");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = connected_tx.send(false);
                        tracing::warn!("broker sent disconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if connected_tx.send_replace(false) {
                            tracing::warn!(error = %e, "mqtt connection lost, reconnecting");
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(30));
                    }
                }
            }
        });

        *transport.event_task.lock().await = Some(task);
        Ok(transport)
    }

    /// Wait until the session is established (subscriptions replayed)
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.connected_rx.clone();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            rx.changed()
                .await
                .map_err(|_| Error::NotConnected("mqtt event loop stopped".to_string()))?;
        }
    }

    /// Current connection state
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Subscribe to a topic filter with QoS 1 and record it for replay
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let filter = filter.into();
        let qos = QoS::AtLeastOnce;
        self.subscriptions.write().await.insert(
            filter.clone(),
            Subscription { qos, handler },
        );
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| Error::NotConnected(format!("subscribe: {e}")))?;
        Ok(())
    }

    /// Remove a subscription and stop replaying it
    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.subscriptions.write().await.remove(filter);
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| Error::NotConnected(format!("unsubscribe: {e}")))?;
        Ok(())
    }

    /// Publish with QoS 1
    pub async fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic.to_string(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| Error::WriteFailed(format!("publish {topic}: {e}")))?;
        Ok(())
    }

    /// Publish a retained message with QoS 1 (health heartbeats)
    pub async fn publish_retained(&self, topic: &Topic, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic.to_string(), QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| Error::WriteFailed(format!("publish {topic}: {e}")))?;
        Ok(())
    }

    /// Disconnect cleanly and stop the event loop task
    pub async fn stop(&self) {
        let _ = self.client.disconnect().await;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("mqtt transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn struct_handler_counts() {
        let handler = CountingHandler(AtomicUsize::new(0));
        handler.handle("a", b"x").await.unwrap();
        handler.handle("b", b"y").await.unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    }
}
