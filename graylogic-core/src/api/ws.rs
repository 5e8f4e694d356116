//! WebSocket hub
//!
//! Clients connect with a one-shot ticket (`/ws?ticket=...`), subscribe to
//! channels, and receive events filtered by their room scope. Every send
//! goes through a bounded per-client queue; a full queue drops the frame
//! for that client and bumps its lag counter — the pipeline is never blocked
//! by a slow consumer.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::auth::RoomScope;
use crate::pipeline::PipelineEvent;
use crate::state::AppState;

pub const CHANNEL_DEVICE_STATE: &str = "device.state_changed";
pub const CHANNEL_SCENE_ACTIVATED: &str = "scene.activated";

const OUTBOUND_QUEUE: usize = 64;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(10);
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Policy violation close code for bad tickets
const CLOSE_POLICY: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub ticket: Option<String>,
}

/// Client → server frame
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Server → client frame
#[derive(Debug, Serialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

impl ServerFrame {
    fn event(channel: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: "event",
            channel: Some(channel.to_string()),
            payload: Some(payload),
            request_id: None,
        }
    }

    fn error(message: &str, request_id: Option<String>) -> Self {
        Self {
            kind: "error",
            channel: None,
            payload: Some(serde_json::json!({ "message": message })),
            request_id,
        }
    }

    fn ack(kind: &'static str, request_id: Option<String>) -> Self {
        Self {
            kind,
            channel: None,
            payload: None,
            request_id,
        }
    }
}

/// GET /ws?ticket=...
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, query.ticket, socket))
}

async fn handle_socket(state: AppState, ticket: Option<String>, mut socket: WebSocket) {
    // Ticket validation happens after the upgrade so the failure mode is a
    // proper 1008 close, not an opaque HTTP error.
    let scope = match authorize(&state, ticket.as_deref()).await {
        Ok(scope) => scope,
        Err(reason) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Writer task: the only place that touches the sink
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            match tokio::time::timeout(WRITE_DEADLINE, sink.send(message)).await {
                Ok(Ok(())) => {
                    if is_close {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let mut events = state.pipeline.subscribe_events();
    let shutdown = state.shutdown.clone();
    let mut subscriptions: HashSet<String> = HashSet::new();
    let mut lagged: u64 = 0;
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut awaiting_pong: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            // Server shutdown: leave the loop so the close frame goes out
            // and the connection stops holding the HTTP drain open.
            () = shutdown.cancelled() => {
                tracing::debug!("ws client closed by server shutdown");
                break;
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_frame(&text, &mut subscriptions, &tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = None;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some((channel, payload)) = render_event(&event, &scope, &subscriptions) {
                            let frame = ServerFrame::event(channel, payload);
                            if let Ok(json) = serde_json::to_string(&frame) {
                                if tx.try_send(Message::Text(json.into())).is_err() {
                                    lagged += 1;
                                    tracing::debug!(lagged, "ws client queue full, frame dropped");
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        lagged += missed;
                        tracing::debug!(missed, "ws client lagged behind event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                awaiting_pong = Some(tokio::time::Instant::now());
                if tx.try_send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }
            () = async {
                match awaiting_pong {
                    Some(since) => tokio::time::sleep_until(since + PONG_DEADLINE).await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::debug!("ws client missed pong deadline, closing");
                break;
            }
        }
    }

    let _ = tx
        .send(Message::Close(Some(CloseFrame {
            code: 1000,
            reason: "bye".into(),
        })))
        .await;
    drop(tx);
    let _ = writer.await;
    if lagged > 0 {
        tracing::info!(lagged, "ws client disconnected with dropped frames");
    }
}

/// Consume the ticket and materialize the caller's scope
async fn authorize(state: &AppState, ticket: Option<&str>) -> Result<RoomScope, &'static str> {
    let Some(ticket) = ticket else {
        return Err("ticket required");
    };
    let user_id = state
        .auth
        .tickets
        .consume(ticket)
        .await
        .map_err(|_| "invalid ticket")?;
    let user = state
        .auth
        .users
        .get(&user_id)
        .await
        .map_err(|_| "unknown user")?;
    if !user.is_active {
        return Err("account disabled");
    }
    state
        .auth
        .scope_for_user(&user)
        .await
        .map_err(|_| "scope resolution failed")
}

async fn handle_client_frame(
    text: &str,
    subscriptions: &mut HashSet<String>,
    tx: &mpsc::Sender<Message>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(_) => {
            send_frame(tx, ServerFrame::error("malformed frame", None));
            return;
        }
    };

    match frame.kind.as_str() {
        "subscribe" => match frame.channel.as_deref() {
            Some(CHANNEL_DEVICE_STATE) | Some(CHANNEL_SCENE_ACTIVATED) => {
                subscriptions.insert(frame.channel.unwrap_or_default());
                send_frame(tx, ServerFrame::ack("subscribed", frame.request_id));
            }
            _ => send_frame(tx, ServerFrame::error("unknown channel", frame.request_id)),
        },
        "unsubscribe" => {
            if let Some(channel) = frame.channel {
                subscriptions.remove(&channel);
            }
            send_frame(tx, ServerFrame::ack("unsubscribed", frame.request_id));
        }
        "ping" => send_frame(tx, ServerFrame::ack("pong", frame.request_id)),
        _ => send_frame(tx, ServerFrame::error("unknown frame type", frame.request_id)),
    }
}

fn send_frame(tx: &mpsc::Sender<Message>, frame: ServerFrame) {
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = tx.try_send(Message::Text(json.into()));
    }
}

/// Map a pipeline event to a channel and payload when the client should see it
fn render_event(
    event: &PipelineEvent,
    scope: &RoomScope,
    subscriptions: &HashSet<String>,
) -> Option<(&'static str, serde_json::Value)> {
    match event {
        PipelineEvent::StateChanged {
            device_id,
            room_id,
            state,
        } => {
            if !subscriptions.contains(CHANNEL_DEVICE_STATE) {
                return None;
            }
            if !scope.admits(room_id.as_deref()) {
                return None;
            }
            Some((
                CHANNEL_DEVICE_STATE,
                serde_json::json!({ "device_id": device_id, "state": state }),
            ))
        }
        PipelineEvent::SceneActivated { scene_id, room_id } => {
            if !subscriptions.contains(CHANNEL_SCENE_ACTIVATED) {
                return None;
            }
            if !scope.admits(room_id.as_deref()) {
                return None;
            }
            Some((
                CHANNEL_SCENE_ACTIVATED,
                serde_json::json!({ "scene_id": scene_id, "room_id": room_id }),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RoomGrant;

    fn scoped(rooms: &[&str]) -> RoomScope {
        RoomScope::from_grants(
            &rooms
                .iter()
                .map(|r| RoomGrant {
                    room_id: (*r).to_string(),
                    can_manage_scenes: false,
                })
                .collect::<Vec<_>>(),
        )
    }

    fn state_event(room: Option<&str>) -> PipelineEvent {
        PipelineEvent::StateChanged {
            device_id: "d1".into(),
            room_id: room.map(str::to_string),
            state: serde_json::Map::new(),
        }
    }

    #[test]
    fn events_require_subscription() {
        let scope = RoomScope::Unrestricted;
        let none = HashSet::new();
        assert!(render_event(&state_event(Some("r1")), &scope, &none).is_none());

        let mut subs = HashSet::new();
        subs.insert(CHANNEL_DEVICE_STATE.to_string());
        assert!(render_event(&state_event(Some("r1")), &scope, &subs).is_some());
    }

    #[test]
    fn events_respect_room_scope() {
        let mut subs = HashSet::new();
        subs.insert(CHANNEL_DEVICE_STATE.to_string());

        let scope = scoped(&["r1"]);
        assert!(render_event(&state_event(Some("r1")), &scope, &subs).is_some());
        assert!(render_event(&state_event(Some("r2")), &scope, &subs).is_none());
        assert!(render_event(&state_event(None), &scope, &subs).is_none());
    }

    #[test]
    fn scene_events_use_their_own_channel() {
        let scope = RoomScope::Unrestricted;
        let mut subs = HashSet::new();
        subs.insert(CHANNEL_SCENE_ACTIVATED.to_string());

        let event = PipelineEvent::SceneActivated {
            scene_id: "s1".into(),
            room_id: None,
        };
        let (channel, payload) = render_event(&event, &scope, &subs).unwrap();
        assert_eq!(channel, CHANNEL_SCENE_ACTIVATED);
        assert_eq!(payload["scene_id"], "s1");
        // Not delivered on the device channel
        assert!(render_event(&state_event(Some("r1")), &scope, &subs).is_none());
    }
}
