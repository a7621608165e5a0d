use std::{sync::Arc, time::Duration};

use conduit_proto::ServiceSpec;
use tracing::{debug, info, warn};

use crate::{
    api::PanelClient,
    store::{DeclaredService, ServiceStore},
};

/// Difference between coordinator-desired and locally-declared
/// services. `extras` only ever names coordinator-managed entries.
#[derive(Debug, Default, PartialEq)]
pub struct Plan {
    pub missing: Vec<ServiceSpec>,
    pub extras: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extras.is_empty()
    }
}

/// Pure plan computation. Missing services are those the coordinator
/// wants but the node has not declared. Extras are only collected in
/// strict mode, and never include services the operator declared by
/// hand (no provenance tag).
pub fn plan(declared: &[DeclaredService], desired: &[ServiceSpec], strict: bool) -> Plan {
    let missing = desired
        .iter()
        .filter(|d| !d.name.is_empty() && !declared.iter().any(|s| s.name == d.name))
        .cloned()
        .collect();

    let extras = if strict {
        declared
            .iter()
            .filter(|s| s.managed && !desired.iter().any(|d| d.name == s.name))
            .map(|s| s.name.clone())
            .collect()
    } else {
        Vec::new()
    };

    Plan { missing, extras }
}

/// Periodic convergence loop. Divergence is never fixed locally: the
/// node reports it and the coordinator replays the authoritative specs
/// back over the command channel, keeping a single write path.
pub struct Reconciler {
    client: Arc<PanelClient>,
    store: ServiceStore,
    strict: bool,
}

impl Reconciler {
    pub fn new(client: Arc<PanelClient>, store: ServiceStore, strict: bool) -> Self {
        Self {
            client,
            store,
            strict,
        }
    }

    pub fn strict_from_env() -> bool {
        matches!(
            std::env::var("CONDUIT_STRICT_RECONCILE").as_deref(),
            Ok("1") | Ok("true")
        )
    }

    fn interval_from_env() -> Duration {
        let secs = std::env::var("CONDUIT_RECONCILE_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(300);
        Duration::from_secs(secs)
    }

    pub async fn run_cycle(&self) {
        let declared = match self.store.declared() {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "reconcile: cannot read service store");
                return;
            }
        };
        let desired = match self.client.desired_services().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "reconcile: desired-services fetch failed");
                return;
            }
        };

        let plan = plan(&declared, &desired, self.strict);
        if plan.is_empty() {
            debug!("reconcile: converged");
            return;
        }

        if !plan.missing.is_empty() {
            let names: Vec<&str> = plan.missing.iter().map(|s| s.name.as_str()).collect();
            info!(?names, "reconcile: reporting missing services");
            if let Err(e) = self.client.push_services(&plan.missing).await {
                warn!(error = %e, "reconcile: push-services failed");
            }
        }

        if !plan.extras.is_empty() {
            info!(names = ?plan.extras, "reconcile: reporting strict-mode extras");
            if let Err(e) = self.client.remove_services(&plan.extras).await {
                warn!(error = %e, "reconcile: remove-services failed");
            }
        }
    }

    /// Reconcile once now, then every `CONDUIT_RECONCILE_INTERVAL`
    /// seconds (default 300).
    pub async fn run_periodic(self) {
        let interval = Self::interval_from_env();
        loop {
            self.run_cycle().await;
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(name: &str) -> ServiceSpec {
        serde_json::from_value(json!({"name": name, "addr": ":1"})).unwrap()
    }

    fn decl(name: &str, managed: bool) -> DeclaredService {
        DeclaredService {
            name: name.into(),
            managed,
        }
    }

    #[test]
    fn converged_state_plans_nothing() {
        let declared = [decl("a", true), decl("b", false)];
        let desired = [spec("a")];
        let p = plan(&declared, &desired, true);
        assert!(p.is_empty() || !p.extras.contains(&"b".to_string()));
        // "a" is present on both sides; only a strict extra could make
        // the plan non-empty, and "b" is unmanaged.
        assert!(p.missing.is_empty());
        assert!(p.extras.is_empty());
    }

    #[test]
    fn missing_services_are_reported_not_written() {
        let declared = [decl("a", true)];
        let desired = [spec("a"), spec("new")];
        let p = plan(&declared, &desired, false);
        assert_eq!(p.missing.len(), 1);
        assert_eq!(p.missing[0].name, "new");
        assert!(p.extras.is_empty());
    }

    #[test]
    fn strict_mode_only_flags_managed_extras() {
        let declared = [decl("managed-extra", true), decl("operator-owned", false)];
        let desired: [ServiceSpec; 0] = [];
        let p = plan(&declared, &desired, true);
        assert_eq!(p.extras, vec!["managed-extra".to_string()]);
    }

    #[test]
    fn lenient_mode_never_flags_extras() {
        let declared = [decl("managed-extra", true)];
        let desired: [ServiceSpec; 0] = [];
        let p = plan(&declared, &desired, false);
        assert!(p.extras.is_empty());
    }

    #[test]
    fn missing_set_applied_through_upsert_converges() {
        use crate::store::{StoreDoc, apply_upsert, declared as store_declared};

        let mut doc = StoreDoc::default();
        apply_upsert(&mut doc, vec![spec("a")], false);

        let desired = [spec("a"), spec("b")];
        let p = plan(&store_declared(&doc), &desired, false);
        assert_eq!(p.missing.len(), 1);
        assert!(p.extras.is_empty(), "lenient mode removes nothing");

        // The coordinator replays the missing set as an AddService push;
        // applying it converges the store.
        apply_upsert(&mut doc, p.missing, false);
        let names: Vec<_> = doc.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let again = plan(&store_declared(&doc), &desired, false);
        assert!(again.is_empty(), "second cycle must plan no work");
    }

    #[test]
    fn plan_is_idempotent() {
        let declared = [decl("a", true)];
        let desired = [spec("a"), spec("b")];
        let first = plan(&declared, &desired, true);
        let second = plan(&declared, &desired, true);
        assert_eq!(first, second);
    }
}
