use std::path::PathBuf;

use anyhow::Context;

/// The two cooperating agent roles. Both run from the same binary; the
/// role follows the installed executable name so a renamed copy becomes
/// the counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Agent1,
    Agent2,
}

impl AgentRole {
    pub fn from_current_exe() -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Self::from_binary_name(&name)
    }

    pub fn from_binary_name(name: &str) -> Self {
        if name.contains("agent2") {
            AgentRole::Agent2
        } else {
            AgentRole::Agent1
        }
    }

    /// Role tag sent in the websocket handshake.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Agent1 => "agent1",
            AgentRole::Agent2 => "agent2",
        }
    }

    /// Installed binary / systemd service name.
    pub fn service_name(self) -> &'static str {
        match self {
            AgentRole::Agent1 => "conduit-agent",
            AgentRole::Agent2 => "conduit-agent2",
        }
    }

    pub fn counterpart(self) -> Self {
        match self {
            AgentRole::Agent1 => AgentRole::Agent2,
            AgentRole::Agent2 => AgentRole::Agent1,
        }
    }

    /// Full reported version string, e.g. `conduit-agent2-0.2.0`.
    pub fn version_string(self) -> String {
        format!("{}-{}", self.service_name(), env!("CARGO_PKG_VERSION"))
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Coordinator `host:port`.
    pub addr: String,
    /// Node secret presented in every handshake and API call.
    pub secret: String,
    /// `ws` or `wss`.
    pub scheme: String,
    pub role: AgentRole,
    pub version: String,
}

#[derive(Debug, Default, serde::Deserialize)]
struct IdentityFile {
    #[serde(default)]
    addr: String,
    #[serde(default)]
    secret: String,
}

fn identity_file_path() -> PathBuf {
    std::env::var("CONDUIT_CONFIG_FILE")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/etc/conduit/config.json"))
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AgentConfig {
    /// Resolve identity from `CONDUIT_ADDR` / `CONDUIT_SECRET` /
    /// `CONDUIT_SCHEME`, falling back to the identity file. A missing
    /// addr or secret is the only fatal startup condition.
    pub fn load() -> anyhow::Result<Self> {
        let mut addr = env_trimmed("CONDUIT_ADDR").unwrap_or_default();
        let mut secret = env_trimmed("CONDUIT_SECRET").unwrap_or_default();
        let scheme = env_trimmed("CONDUIT_SCHEME").unwrap_or_else(|| "ws".to_string());

        if addr.is_empty() || secret.is_empty() {
            let path = identity_file_path();
            if let Ok(raw) = std::fs::read_to_string(&path) {
                let file: IdentityFile = serde_json::from_str(&raw)
                    .with_context(|| format!("parse identity file {}", path.display()))?;
                if addr.is_empty() {
                    addr = file.addr.trim().to_string();
                }
                if secret.is_empty() {
                    secret = file.secret.trim().to_string();
                }
            }
        }

        if addr.is_empty() || secret.is_empty() {
            anyhow::bail!(
                "missing CONDUIT_ADDR/CONDUIT_SECRET (env) and {} fallback",
                identity_file_path().display()
            );
        }

        let role = AgentRole::from_current_exe();
        Ok(Self {
            addr,
            secret,
            scheme,
            role,
            version: role.version_string(),
        })
    }

    pub fn ws_url(&self) -> String {
        format!(
            "{}://{}/system-info?type=1&secret={}&version={}&role={}",
            self.scheme,
            self.addr,
            encode_query(&self.secret),
            encode_query(&self.version),
            self.role.as_str(),
        )
    }

    /// HTTP base for the coordinator API (`ws`→`http`, `wss`→`https`).
    pub fn http_base(&self) -> String {
        let proto = if self.scheme == "wss" { "https" } else { "http" };
        format!("{proto}://{}", self.addr)
    }
}

/// Percent-encode a query component. Unreserved characters pass
/// through untouched.
fn encode_query(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
