use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc};

pub type NodeId = i64;

/// One live websocket connection of a node. Outbound frames go through
/// the mpsc sender; the owning socket task drains the receiver.
#[derive(Debug)]
pub struct NodeConnection {
    pub id: u64,
    pub version: String,
    pub role: String,
    tx: mpsc::Sender<String>,
}

impl NodeConnection {
    pub async fn send(&self, text: String) -> bool {
        self.tx.send(text).await.is_ok()
    }
}

/// Coordinator-side bookkeeping of node connections. A node may hold
/// several connections at once (cooperating agent roles); it is online
/// iff its connection list is non-empty.
///
/// The lock is never held across a send: callers take a snapshot,
/// release, then write.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    inner: Arc<RwLock<HashMap<NodeId, Vec<Arc<NodeConnection>>>>>,
    next_id: Arc<AtomicU64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection. Returns the connection handle, the
    /// receiver its socket task must drain, and whether this connection
    /// brought the node online (its first one).
    pub async fn register(
        &self,
        node: NodeId,
        version: String,
        role: String,
    ) -> (Arc<NodeConnection>, mpsc::Receiver<String>, bool) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Arc::new(NodeConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            version,
            role,
            tx,
        });

        let mut map = self.inner.write().await;
        let list = map.entry(node).or_default();
        let came_online = list.is_empty();
        list.push(conn.clone());
        (conn, rx, came_online)
    }

    /// Remove one specific connection. Returns true iff this call both
    /// found the connection and emptied the node's list — the caller
    /// that sees `true` owns the offline transition, exactly once, even
    /// when several closing connections race here.
    pub async fn unregister(&self, node: NodeId, conn_id: u64) -> bool {
        let mut map = self.inner.write().await;
        let Some(list) = map.get_mut(&node) else {
            return false;
        };
        let before = list.len();
        list.retain(|c| c.id != conn_id);
        let removed = list.len() < before;
        if list.is_empty() {
            map.remove(&node);
            return removed;
        }
        false
    }

    /// Short-lived copy of a node's connections, for send operations.
    pub async fn snapshot(&self, node: NodeId) -> Vec<Arc<NodeConnection>> {
        self.inner
            .read()
            .await
            .get(&node)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_online(&self, node: NodeId) -> bool {
        self.inner
            .read()
            .await
            .get(&node)
            .is_some_and(|l| !l.is_empty())
    }

    pub async fn online_nodes(&self) -> Vec<NodeId> {
        self.inner.read().await.keys().copied().collect()
    }

    /// Send to every connection of a node; returns how many accepted
    /// the frame.
    pub async fn broadcast(&self, node: NodeId, text: &str) -> usize {
        let conns = self.snapshot(node).await;
        let mut sent = 0;
        for conn in conns {
            if conn.send(text.to_string()).await {
                sent += 1;
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_online_iff_connections_exist() {
        let reg = NodeRegistry::new();
        assert!(!reg.is_online(7).await);

        let (c1, _rx1, online) = reg.register(7, "v1".into(), "agent1".into()).await;
        assert!(online);
        assert!(reg.is_online(7).await);

        let (c2, _rx2, online) = reg.register(7, "v2".into(), "agent2".into()).await;
        assert!(!online, "second connection must not re-trigger online");

        assert!(!reg.unregister(7, c1.id).await);
        assert!(reg.is_online(7).await);
        assert!(reg.unregister(7, c2.id).await);
        assert!(!reg.is_online(7).await);
    }

    #[tokio::test]
    async fn offline_transition_fires_exactly_once_under_races() {
        let reg = NodeRegistry::new();
        let (c1, _rx1, _) = reg.register(1, "v".into(), "agent1".into()).await;
        let (c2, _rx2, _) = reg.register(1, "v".into(), "agent2".into()).await;

        // Both connections close concurrently, each retrying the
        // unregister as a crashing socket task might.
        let mut offline = 0;
        for id in [c1.id, c2.id, c1.id, c2.id] {
            if reg.unregister(1, id).await {
                offline += 1;
            }
        }
        assert_eq!(offline, 1);
    }

    #[tokio::test]
    async fn broadcast_counts_reachable_connections() {
        let reg = NodeRegistry::new();
        let (_c1, mut rx1, _) = reg.register(3, "v".into(), "agent1".into()).await;
        let (_c2, rx2, _) = reg.register(3, "v".into(), "agent2".into()).await;
        drop(rx2); // dead socket

        assert_eq!(reg.broadcast(3, "hello").await, 1);
        assert_eq!(rx1.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn snapshot_preserves_registration_order() {
        let reg = NodeRegistry::new();
        let (_a, _rxa, _) = reg.register(5, "v1".into(), "agent1".into()).await;
        let (_b, _rxb, _) = reg.register(5, "v2".into(), "agent2".into()).await;
        let snap = reg.snapshot(5).await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].role, "agent1");
        assert_eq!(snap[1].role, "agent2");
    }
}
