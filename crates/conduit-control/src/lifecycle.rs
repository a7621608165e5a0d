use std::{collections::HashMap, sync::Mutex, time::Duration};

use crate::registry::NodeId;

/// Resolved node identity. The secret is the node's opaque credential
/// presented in the websocket handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub name: String,
}

/// Maps handshake secrets to node identities. Real deployments back
/// this with the admin store; the in-tree implementation reads a static
/// table from the environment.
pub trait NodeDirectory: Send + Sync + 'static {
    fn resolve(&self, secret: &str) -> Option<NodeIdentity>;
}

/// `CONDUIT_NODES=1:edge-a:s3cret,2:edge-b:other` — `id:name:secret`
/// entries, comma separated.
#[derive(Debug, Default)]
pub struct StaticNodeDirectory {
    by_secret: HashMap<String, NodeIdentity>,
}

impl StaticNodeDirectory {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("CONDUIT_NODES").unwrap_or_default())
    }

    pub fn parse(raw: &str) -> Self {
        let mut by_secret = HashMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            let (Some(id), Some(name), Some(secret)) =
                (parts.next(), parts.next(), parts.next())
            else {
                tracing::warn!(entry, "ignoring malformed node entry");
                continue;
            };
            let Ok(id) = id.trim().parse::<NodeId>() else {
                tracing::warn!(entry, "ignoring node entry with non-numeric id");
                continue;
            };
            by_secret.insert(
                secret.trim().to_string(),
                NodeIdentity {
                    id,
                    name: name.trim().to_string(),
                },
            );
        }
        Self { by_secret }
    }
}

impl NodeDirectory for StaticNodeDirectory {
    fn resolve(&self, secret: &str) -> Option<NodeIdentity> {
        self.by_secret.get(secret).cloned()
    }
}

/// Open disconnect records, keyed by node. A record opens when the last
/// connection closes and is closed (yielding the downtime) when the
/// node returns.
#[derive(Default)]
pub struct DisconnectLog {
    open: Mutex<HashMap<NodeId, i64>>,
}

impl DisconnectLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the down timestamp iff a record was newly opened.
    pub fn open(&self, node: NodeId) -> Option<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut map = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&node) {
            return None;
        }
        map.insert(node, now);
        Some(now)
    }

    /// Close any open record, returning the downtime in seconds.
    pub fn close(&self, node: NodeId) -> Option<i64> {
        let down_at = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node)?;
        Some((chrono::Utc::now().timestamp_millis() - down_at) / 1000)
    }
}

/// External-collaborator seam for node lifecycle events: alert records,
/// audit persistence, webhook notification. Implementations must not
/// block; slow work is spawned internally.
pub trait LifecycleSink: Send + Sync + 'static {
    fn node_online(&self, node: &NodeIdentity, downtime_s: Option<i64>);
    fn node_offline(&self, node: &NodeIdentity, down_at_ms: i64);
}

pub struct NoopLifecycle;

impl LifecycleSink for NoopLifecycle {
    fn node_online(&self, _node: &NodeIdentity, _downtime_s: Option<i64>) {}
    fn node_offline(&self, _node: &NodeIdentity, _down_at_ms: i64) {}
}

/// Fires a JSON POST to a configured URL on each transition.
pub struct WebhookLifecycle {
    url: String,
    client: reqwest::Client,
}

impl WebhookLifecycle {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("CONDUIT_CALLBACK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;
        let client = reqwest::Client::builder()
            .user_agent("conduit-control")
            .timeout(Duration::from_secs(5))
            .build()
            .ok()?;
        Some(Self { url, client })
    }

    fn post(&self, payload: serde_json::Value) {
        let url = self.url.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                tracing::warn!(error = %e, "lifecycle callback failed");
            }
        });
    }
}

impl LifecycleSink for WebhookLifecycle {
    fn node_online(&self, node: &NodeIdentity, downtime_s: Option<i64>) {
        self.post(serde_json::json!({
            "event": "agent_online",
            "nodeId": node.id,
            "name": node.name,
            "time": chrono::Utc::now().timestamp_millis(),
            "durationS": downtime_s,
        }));
    }

    fn node_offline(&self, node: &NodeIdentity, down_at_ms: i64) {
        self.post(serde_json::json!({
            "event": "agent_offline",
            "nodeId": node.id,
            "name": node.name,
            "time": chrono::Utc::now().timestamp_millis(),
            "downAtMs": down_at_ms,
        }));
    }
}

/// Sink for node telemetry samples; persistence is out of scope here.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, node: NodeId, payload: &serde_json::Value);
}

pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _node: NodeId, _payload: &serde_json::Value) {}
}

pub fn mask_secret(s: &str) -> String {
    if s.len() <= 4 {
        return "****".to_string();
    }
    format!("{}****{}", &s[..2], &s[s.len() - 2..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_parses_and_resolves() {
        let dir = StaticNodeDirectory::parse("1:edge-a:alpha, 2:edge-b:beta,broken");
        assert_eq!(
            dir.resolve("alpha"),
            Some(NodeIdentity {
                id: 1,
                name: "edge-a".into()
            })
        );
        assert_eq!(dir.resolve("beta").unwrap().id, 2);
        assert!(dir.resolve("nope").is_none());
    }

    #[test]
    fn disconnect_record_opens_once() {
        let log = DisconnectLog::new();
        assert!(log.open(1).is_some());
        assert!(log.open(1).is_none(), "second open must not clobber");
        assert!(log.close(1).is_some());
        assert!(log.close(1).is_none());
    }

    #[test]
    fn secret_masking() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdefgh"), "ab****gh");
    }
}
