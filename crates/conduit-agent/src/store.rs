use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use conduit_proto::{
    Chain, MANAGED_BY_TAG, ServiceSpec, ServiceSummary, parse_port,
};
use serde_json::{Map, Value};

/// The node's declarative service document. Unknown top-level fields
/// (the proxy process owns plenty) survive rewrites via `extra`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoreDoc {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub chains: Vec<Chain>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A declared service as reconciliation sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredService {
    pub name: String,
    /// True when the coordinator created it (provenance tag match).
    pub managed: bool,
}

/// Upsert the listed services. With `update_only` set, names absent
/// from the document are silently skipped. Embedded `_chains` are
/// merged into the top-level chain list first, and a missing chain a
/// service references is synthesized from its forwarding target.
pub fn apply_upsert(doc: &mut StoreDoc, services: Vec<ServiceSpec>, update_only: bool) -> usize {
    let mut applied = 0;
    for mut spec in services {
        if spec.name.is_empty() {
            continue;
        }

        for chain in std::mem::take(&mut spec.chains) {
            upsert_chain(doc, chain);
        }
        if let Some(chain_name) = spec.chain_ref()
            && !doc.chains.iter().any(|c| c.name == chain_name)
            && let Some(addr) = spec.first_forward_addr()
        {
            let synthesized = Chain::single_hop(chain_name, addr);
            doc.chains.push(synthesized);
        }

        match doc.services.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => {
                *existing = spec;
                applied += 1;
            }
            None if !update_only => {
                doc.services.push(spec);
                applied += 1;
            }
            None => {}
        }
    }
    applied
}

fn upsert_chain(doc: &mut StoreDoc, chain: Chain) {
    if chain.name.is_empty() {
        return;
    }
    match doc.chains.iter_mut().find(|c| c.name == chain.name) {
        Some(existing) => *existing = chain,
        None => doc.chains.push(chain),
    }
}

/// Remove by name; unknown names are no-ops. Chains are never removed
/// automatically.
pub fn apply_remove(doc: &mut StoreDoc, names: &[String]) -> usize {
    let before = doc.services.len();
    doc.services
        .retain(|s| !names.iter().any(|n| !n.is_empty() && *n == s.name));
    before - doc.services.len()
}

/// Toggle the paused intent flag; the underlying handler keeps running.
pub fn apply_paused(doc: &mut StoreDoc, names: &[String], paused: bool) -> usize {
    let mut touched = 0;
    for svc in doc.services.iter_mut() {
        if names.iter().any(|n| *n == svc.name) {
            svc.set_paused(paused);
            touched += 1;
        }
    }
    touched
}

/// Summarize declared services, optionally filtered by handler type,
/// annotating each with a reachability probe of its bound port.
pub fn summarize(
    doc: &StoreDoc,
    filter: Option<&str>,
    probe: &dyn Fn(u16) -> bool,
) -> Vec<ServiceSummary> {
    doc.services
        .iter()
        .filter_map(|svc| {
            let handler = svc.handler_type().unwrap_or_default();
            if let Some(f) = filter
                && !f.is_empty()
                && !handler.eq_ignore_ascii_case(f)
            {
                return None;
            }
            let addr = svc.addr.clone().unwrap_or_default();
            let port = parse_port(&addr);
            Some(ServiceSummary {
                name: svc.name.clone(),
                addr,
                handler: handler.to_string(),
                port,
                listening: port > 0 && probe(port),
                limiter: svc.limiter.clone(),
                rlimiter: svc.rlimiter.clone(),
                metadata: svc.metadata.clone(),
            })
        })
        .collect()
}

pub fn declared(doc: &StoreDoc) -> Vec<DeclaredService> {
    doc.services
        .iter()
        .filter(|s| !s.name.is_empty())
        .map(|s| DeclaredService {
            name: s.name.clone(),
            managed: s.is_managed_by(MANAGED_BY_TAG),
        })
        .collect()
}

/// Loopback connect probe used by QueryServices.
pub fn port_listening(port: u16) -> bool {
    const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
    if port == 0 {
        return false;
    }
    let v4 = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    if TcpStream::connect_timeout(&v4, PROBE_TIMEOUT).is_ok() {
        return true;
    }
    let v6 = SocketAddr::from((Ipv6Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&v6, PROBE_TIMEOUT).is_ok()
}

/// File-backed store. Reads tolerate a missing or empty document;
/// writes pretty-print and rewrite the whole file.
#[derive(Debug, Clone)]
pub struct ServiceStore {
    path: PathBuf,
}

impl ServiceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `CONDUIT_SERVICES_FILE` override, else the first candidate that
    /// holds a non-empty document, else the default install path.
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("CONDUIT_SERVICES_FILE")
            && !path.trim().is_empty()
        {
            return Self::new(path.trim());
        }
        const CANDIDATES: &[&str] = &[
            "/etc/conduit/services.json",
            "/usr/local/conduit/services.json",
            "./services.json",
        ];
        for candidate in CANDIDATES {
            if std::fs::read(candidate).map(|b| !b.is_empty()).unwrap_or(false) {
                return Self::new(*candidate);
            }
        }
        Self::new(CANDIDATES[0])
    }

    pub fn load(&self) -> anyhow::Result<StoreDoc> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) if !raw.trim().is_empty() => raw,
            Ok(_) => return Ok(StoreDoc::default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StoreDoc::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        serde_json::from_str(&raw).with_context(|| format!("parse {}", self.path.display()))
    }

    pub fn save(&self, doc: &StoreDoc) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir).ok();
        }
        let pretty = serde_json::to_string_pretty(doc)?;
        std::fs::write(&self.path, pretty)
            .with_context(|| format!("write {}", self.path.display()))
    }

    pub fn upsert(&self, services: Vec<ServiceSpec>, update_only: bool) -> anyhow::Result<usize> {
        let mut doc = self.load()?;
        let applied = apply_upsert(&mut doc, services, update_only);
        self.save(&doc)?;
        Ok(applied)
    }

    pub fn remove(&self, names: &[String]) -> anyhow::Result<usize> {
        let mut doc = self.load()?;
        let removed = apply_remove(&mut doc, names);
        self.save(&doc)?;
        Ok(removed)
    }

    pub fn set_paused(&self, names: &[String], paused: bool) -> anyhow::Result<usize> {
        let mut doc = self.load()?;
        let touched = apply_paused(&mut doc, names, paused);
        self.save(&doc)?;
        Ok(touched)
    }

    pub fn query(&self, filter: Option<&str>) -> anyhow::Result<Vec<ServiceSummary>> {
        let doc = self.load()?;
        Ok(summarize(&doc, filter, &port_listening))
    }

    pub fn declared(&self) -> anyhow::Result<Vec<DeclaredService>> {
        Ok(declared(&self.load()?))
    }
}
