use std::sync::Arc;

use conduit_proto::{Command, ReplyFrame, decode_frame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    api::PanelClient,
    config::AgentRole,
    diagnose,
    store::ServiceStore,
    upgrade,
};

/// Routes decoded command frames to their handlers. Service mutations
/// run inline so they apply in arrival order; slow work (diagnostics,
/// upgrades) is spawned so the read loop keeps draining.
#[derive(Clone)]
pub struct Dispatcher {
    store: ServiceStore,
    client: Arc<PanelClient>,
    role: AgentRole,
    version: String,
    out: mpsc::Sender<Message>,
}

impl Dispatcher {
    pub fn new(
        store: ServiceStore,
        client: Arc<PanelClient>,
        role: AgentRole,
        version: String,
        out: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            store,
            client,
            role,
            version,
            out,
        }
    }

    async fn reply(&self, frame: ReplyFrame) {
        if self.out.send(Message::text(frame.to_text())).await.is_err() {
            warn!(kind = %frame.kind, "reply dropped: connection writer gone");
        }
    }

    pub async fn handle_frame(&self, payload: &[u8]) {
        let env = match decode_frame(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable frame");
                return;
            }
        };
        let cmd = match Command::from_envelope(&env) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(kind = %env.kind, error = %e, "ignoring malformed command payload");
                return;
            }
        };

        match cmd {
            Command::Diagnose(req) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let report = diagnose::run(&req).await;
                    this.reply(ReplyFrame::diagnose_result(req.request_id, &report))
                        .await;
                });
            }
            Command::QueryServices(req) => {
                let this = self.clone();
                tokio::spawn(async move {
                    let store = this.store.clone();
                    let filter = req.filter.clone();
                    let summaries = tokio::task::spawn_blocking(move || {
                        store.query(filter.as_deref())
                    })
                    .await
                    .unwrap_or_else(|e| Err(anyhow::anyhow!("query task panicked: {e}")));
                    match summaries {
                        Ok(list) => {
                            this.reply(ReplyFrame::query_services_result(req.request_id, &list))
                                .await;
                        }
                        Err(e) => warn!(error = %e, "service query failed"),
                    }
                });
            }
            Command::AddService(list) => self.apply("AddService", || {
                self.store.upsert(list.clone(), false)
            }),
            Command::UpdateService(list) => self.apply("UpdateService", || {
                self.store.upsert(list.clone(), true)
            }),
            Command::DeleteService(names) => self.apply("DeleteService", || {
                self.store.remove(&names.services)
            }),
            Command::PauseService(names) => self.apply("PauseService", || {
                self.store.set_paused(&names.services, true)
            }),
            Command::ResumeService(names) => self.apply("ResumeService", || {
                self.store.set_paused(&names.services, false)
            }),
            Command::UpgradeAgent(req) => {
                if let Some(to) = req.to.as_deref()
                    && to == self.version
                {
                    debug!(version = %self.version, "upgrade skipped: already at target");
                    return;
                }
                let client = self.client.clone();
                let role = self.role;
                tokio::spawn(async move {
                    if let Err(e) = upgrade::self_upgrade(&client, role).await {
                        warn!(error = %e, "self-upgrade failed");
                    }
                });
            }
            Command::UpgradeAgent1 => self.spawn_install(AgentRole::Agent1),
            Command::UpgradeAgent2 => self.spawn_install(AgentRole::Agent2),
            Command::Unknown(kind) => debug!(%kind, "ignoring unknown command"),
        }
    }

    /// Service mutations have no reply channel; the outcome is logged
    /// and visible to the next QueryServices or reconcile cycle.
    fn apply(&self, kind: &str, op: impl FnOnce() -> anyhow::Result<usize>) {
        match op() {
            Ok(n) => info!(command = kind, applied = n, "service store updated"),
            Err(e) => warn!(command = kind, error = %e, "service store update failed"),
        }
    }

    fn spawn_install(&self, role: AgentRole) {
        if role == self.role {
            // Installing over our own running binary goes through the
            // full self-upgrade path instead.
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) = upgrade::self_upgrade(&client, role).await {
                    warn!(error = %e, "self-upgrade failed");
                }
            });
            return;
        }
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = upgrade::ensure_role_installed(&client, role, None).await {
                warn!(role = role.as_str(), error = %e, "install failed");
            }
        });
    }
}
