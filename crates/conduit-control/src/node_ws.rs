use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::Instrument;

use conduit_proto::{Command, ReplyFrame, UpgradeRequest};

use crate::lifecycle::{NodeIdentity, mask_secret};
use crate::registry::NodeConnection;
use crate::state::AppState;

/// Any frame (pings included) resets the liveness window; a silent
/// connection past this is treated as lost.
const READ_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, serde::Deserialize)]
pub struct HandshakeQuery {
    /// 0 = observer, 1 = node agent.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// `GET /system-info?type={0|1}&secret=..&version=..&role=..`
pub async fn system_info_ws(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if query.kind.as_deref() == Some("0") {
            handle_observer(state, socket).await;
            return;
        }

        let secret = query.secret.unwrap_or_default();
        let Some(node) = state.directory.resolve(&secret) else {
            tracing::warn!(secret = %mask_secret(&secret), "rejecting unknown node");
            return;
        };
        let version = query.version.unwrap_or_default();
        let role = query.role.unwrap_or_else(|| "agent1".to_string());

        let span = tracing::info_span!("node_ws", node = node.id, %role);
        handle_node(state, socket, node, version, role)
            .instrument(span)
            .await;
    })
}

async fn handle_observer(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = state.observers.subscribe().await;
    tracing::debug!(observer = id, "observer connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Held open purely to detect close.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.observers.unsubscribe(id).await;
    writer.abort();
    tracing::debug!(observer = id, "observer disconnected");
}

async fn handle_node(
    state: AppState,
    socket: WebSocket,
    node: NodeIdentity,
    version: String,
    role: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let (conn, mut rx, came_online) = state
        .registry
        .register(node.id, version.clone(), role.clone())
        .await;
    tracing::info!(name = %node.name, %version, "node connected");

    if came_online {
        state.observers.status_change(node.id, true).await;
        let downtime = state.disconnects.close(node.id);
        state.lifecycle.node_online(&node, downtime);
    }

    maybe_push_upgrade(&conn, state.expected.for_role(&role)).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = match tokio::time::timeout(READ_DEADLINE, receiver.next()).await {
            Err(_) => {
                tracing::warn!("liveness window elapsed, dropping connection");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => route_frame(&state, &node, text.as_bytes()).await,
            Message::Binary(bytes) => route_frame(&state, &node, &bytes).await,
            Message::Close(_) => break,
            // Pings/pongs only feed the liveness window.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let went_offline = state.registry.unregister(node.id, conn.id).await;
    writer.abort();
    tracing::info!(name = %node.name, "node connection closed");

    if went_offline {
        state.observers.status_change(node.id, false).await;
        if let Some(down_at) = state.disconnects.open(node.id) {
            state.lifecycle.node_offline(&node, down_at);
        }
    }
}

/// Push an `UpgradeAgent` to a connection that reported a stale
/// version. Written directly to that connection: the upgrade must reach
/// the agent that is stale, not whichever role a generic send prefers.
async fn maybe_push_upgrade(conn: &NodeConnection, expected: &str) {
    if conn.version.is_empty() || conn.version == expected {
        return;
    }
    tracing::info!(from = %conn.version, to = %expected, "agent version stale, triggering upgrade");
    let frame = Command::UpgradeAgent(UpgradeRequest {
        to: Some(expected.to_string()),
    })
    .to_envelope()
    .to_text();
    if !conn.send(frame).await {
        tracing::warn!("upgrade push failed");
    }
}

/// A node connection carries three kinds of inbound traffic: command
/// replies (correlated by request id), bare telemetry objects, and
/// noise. None of them may terminate the read loop.
async fn route_frame(state: &AppState, node: &NodeIdentity, payload: &[u8]) {
    if let Ok(text) = std::str::from_utf8(payload)
        && let Ok(reply) = serde_json::from_str::<ReplyFrame>(text)
        && ReplyFrame::is_reply_kind(&reply.kind)
    {
        let delivered = state
            .correlator
            .deliver(&reply.request_id, serde_json::to_value(&reply).unwrap_or(Value::Null))
            .await;
        if !delivered {
            tracing::debug!(request_id = %reply.request_id, kind = %reply.kind, "dropping late reply");
        }
        return;
    }

    match serde_json::from_slice::<Value>(payload) {
        Ok(value) if value.get("type").is_none() && value.is_object() => {
            let Some(sample) = normalize_telemetry(&value) else {
                return;
            };
            state.telemetry.record(node.id, &sample);
            state
                .observers
                .broadcast(&serde_json::json!({
                    "id": node.id,
                    "type": "info",
                    "data": sample,
                }))
                .await;
        }
        Ok(value) => {
            tracing::debug!(payload = %value, "unhandled json frame");
        }
        Err(_) => {
            tracing::debug!(len = payload.len(), "non-json frame dropped");
        }
    }
}

/// Agents historically report telemetry with PascalCase keys; newer ones
/// already use snake_case. Normalize to the latter and drop everything
/// unknown.
pub fn normalize_telemetry(value: &Value) -> Option<Value> {
    const KEYS: &[(&str, &str)] = &[
        ("Uptime", "uptime"),
        ("BytesReceived", "bytes_received"),
        ("BytesTransmitted", "bytes_transmitted"),
        ("CPUUsage", "cpu_usage"),
        ("MemoryUsage", "memory_usage"),
        ("Interfaces", "interfaces"),
    ];

    let obj = value.as_object()?;
    let mut out = serde_json::Map::new();
    for (pascal, snake) in KEYS {
        if let Some(v) = obj.get(*pascal).or_else(|| obj.get(*snake)) {
            out.insert((*snake).to_string(), v.clone());
        }
    }
    if out.is_empty() {
        return None;
    }
    Some(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use serde_json::json;

    #[tokio::test]
    async fn stale_agent2_gets_the_upgrade_not_agent1() {
        let reg = NodeRegistry::new();
        let (c1, mut rx1, _) = reg
            .register(1, "conduit-agent-0.2.0".into(), "agent1".into())
            .await;
        let (c2, mut rx2, _) = reg
            .register(1, "conduit-agent2-0.1.0".into(), "agent2".into())
            .await;

        // agent1 is current, agent2 is stale.
        maybe_push_upgrade(&c1, "conduit-agent-0.2.0").await;
        maybe_push_upgrade(&c2, "conduit-agent2-0.2.0").await;

        assert!(rx1.try_recv().is_err(), "up-to-date agent1 must not be told to upgrade");
        let frame: Value = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "UpgradeAgent");
        assert_eq!(frame["data"]["to"], "conduit-agent2-0.2.0");
    }

    #[tokio::test]
    async fn unreported_version_is_not_upgraded() {
        let reg = NodeRegistry::new();
        let (c, mut rx, _) = reg.register(2, String::new(), "agent1".into()).await;
        maybe_push_upgrade(&c, "conduit-agent-0.2.0").await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn telemetry_keys_normalize_from_either_casing() {
        let sample = normalize_telemetry(&json!({
            "Uptime": 120,
            "BytesReceived": 10,
            "bytes_transmitted": 20,
            "CPUUsage": 3.5,
            "junk": true,
        }))
        .unwrap();
        assert_eq!(sample["uptime"], 120);
        assert_eq!(sample["bytes_received"], 10);
        assert_eq!(sample["bytes_transmitted"], 20);
        assert_eq!(sample["cpu_usage"], 3.5);
        assert!(sample.get("junk").is_none());
    }

    #[test]
    fn non_telemetry_objects_are_rejected() {
        assert!(normalize_telemetry(&json!({"foo": 1})).is_none());
        assert!(normalize_telemetry(&json!([1, 2])).is_none());
    }
}
