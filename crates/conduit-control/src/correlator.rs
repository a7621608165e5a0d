use std::{collections::HashMap, time::Duration};

use serde_json::Value;
use tokio::sync::{Mutex, oneshot};

/// Matches an asynchronous reply back to its originating request by a
/// caller-chosen id. Single-slot per id, at-most-once delivery; a late
/// reply after the waiter timed out is silently dropped.
#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter before sending the command, so a fast reply
    /// cannot race past it. A duplicate id replaces (and thereby
    /// cancels) the previous in-flight waiter — ids must be unique
    /// among in-flight requests.
    pub async fn register(&self, request_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id.to_string(), tx);
        rx
    }

    /// Block (holding no lock) until the reply arrives or the timeout
    /// elapses. On timeout the waiter unregisters itself.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
    ) -> Option<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) | Err(_) => {
                self.waiters.lock().await.remove(request_id);
                None
            }
        }
    }

    /// Forget an in-flight waiter (e.g. the send failed after
    /// registration).
    pub async fn discard(&self, request_id: &str) {
        self.waiters.lock().await.remove(request_id);
    }

    /// Hand a reply to whoever is waiting. Never blocks the delivering
    /// read loop; returns false when nobody is (unknown id, already
    /// timed out, or already answered).
    pub async fn deliver(&self, request_id: &str, value: Value) -> bool {
        let Some(tx) = self.waiters.lock().await.remove(request_id) else {
            return false;
        };
        tx.send(value).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reply_reaches_waiter() {
        let c = Correlator::new();
        let rx = c.register("r1").await;
        assert!(c.deliver("r1", json!({"ok": true})).await);
        let got = c.wait("r1", rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got["ok"], true);
    }

    #[tokio::test]
    async fn deliver_after_timeout_is_dropped() {
        let c = Correlator::new();
        let rx = c.register("r2").await;
        assert!(c.wait("r2", rx, Duration::from_millis(10)).await.is_none());
        assert!(!c.deliver("r2", json!(1)).await);
    }

    #[tokio::test]
    async fn deliver_unknown_id_is_noop() {
        let c = Correlator::new();
        assert!(!c.deliver("never-registered", json!(1)).await);
    }

    #[tokio::test]
    async fn second_delivery_for_same_id_is_dropped() {
        let c = Correlator::new();
        let rx = c.register("r3").await;
        assert!(c.deliver("r3", json!(1)).await);
        assert!(!c.deliver("r3", json!(2)).await);
        let got = c.wait("r3", rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, json!(1));
    }
}
