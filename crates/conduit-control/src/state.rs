use std::sync::Arc;

use crate::correlator::Correlator;
use crate::lifecycle::{
    DisconnectLog, LifecycleSink, NodeDirectory, NoopLifecycle, NoopTelemetry, StaticNodeDirectory,
    TelemetrySink, WebhookLifecycle,
};
use crate::observer::ObserverHub;
use crate::registry::NodeRegistry;

/// Versions each agent role is expected to report. A mismatch on
/// connect triggers an automatic `UpgradeAgent` push.
#[derive(Debug, Clone)]
pub struct ExpectedVersions {
    pub agent: String,
    pub agent2: String,
}

impl ExpectedVersions {
    pub fn from_env() -> Self {
        let default1 = format!("conduit-agent-{}", env!("CARGO_PKG_VERSION"));
        let default2 = format!("conduit-agent2-{}", env!("CARGO_PKG_VERSION"));
        Self {
            agent: env_or("CONDUIT_AGENT_VERSION", &default1),
            agent2: env_or("CONDUIT_AGENT2_VERSION", &default2),
        }
    }

    pub fn for_role(&self, role: &str) -> &str {
        if role == "agent2" {
            &self.agent2
        } else {
            &self.agent
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[derive(Clone)]
pub struct AppState {
    pub registry: NodeRegistry,
    pub observers: ObserverHub,
    pub correlator: Arc<Correlator>,
    pub disconnects: Arc<DisconnectLog>,
    pub directory: Arc<dyn NodeDirectory>,
    pub lifecycle: Arc<dyn LifecycleSink>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub expected: ExpectedVersions,
}

impl AppState {
    pub fn from_env() -> Self {
        let lifecycle: Arc<dyn LifecycleSink> = match WebhookLifecycle::from_env() {
            Some(hook) => Arc::new(hook),
            None => Arc::new(NoopLifecycle),
        };
        Self {
            registry: NodeRegistry::new(),
            observers: ObserverHub::new(),
            correlator: Arc::new(Correlator::new()),
            disconnects: Arc::new(DisconnectLog::new()),
            directory: Arc::new(StaticNodeDirectory::from_env()),
            lifecycle,
            telemetry: Arc::new(NoopTelemetry),
            expected: ExpectedVersions::from_env(),
        }
    }
}
