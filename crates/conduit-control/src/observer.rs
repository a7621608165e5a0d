use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::{RwLock, mpsc};

/// Observer (monitoring UI) connections. They receive node status
/// transitions and live telemetry as `{id, type, data}` frames and
/// never send anything meaningful back.
#[derive(Clone, Default)]
pub struct ObserverHub {
    inner: Arc<RwLock<HashMap<u64, mpsc::Sender<String>>>>,
    next_id: Arc<AtomicU64>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.inner.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.inner.write().await.remove(&id);
    }

    pub async fn broadcast(&self, value: &impl serde::Serialize) {
        let Ok(text) = serde_json::to_string(value) else {
            return;
        };
        let targets: Vec<_> = self.inner.read().await.values().cloned().collect();
        for tx in targets {
            let _ = tx.send(text.clone()).await;
        }
    }

    pub async fn status_change(&self, node: crate::registry::NodeId, online: bool) {
        self.broadcast(&serde_json::json!({
            "id": node,
            "type": "status",
            "data": if online { 1 } else { 0 },
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_reaches_all_observers() {
        let hub = ObserverHub::new();
        let (_a, mut rx_a) = hub.subscribe().await;
        let (b, mut rx_b) = hub.subscribe().await;

        hub.status_change(9, true).await;
        let frame: serde_json::Value =
            serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], 9);
        assert_eq!(frame["data"], 1);
        assert!(rx_b.recv().await.is_some());

        hub.unsubscribe(b).await;
        hub.status_change(9, false).await;
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_none());
    }
}
