use serde_json::{Map, Value};

/// A declared proxy service as it appears in the node's declarative
/// configuration and in coordinator pushes. Only the fields the control
/// plane reads are typed; everything else round-trips through `extra`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<Handler>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarder: Option<Forwarder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Chains the coordinator piggybacks onto a service push. Consumed
    /// (upserted into the store's top-level chain list) before the
    /// service itself is applied; never written back per-service.
    #[serde(
        rename = "_chains",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub chains: Vec<Chain>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServiceSpec {
    pub fn handler_type(&self) -> Option<&str> {
        self.handler.as_ref().and_then(|h| h.kind.as_deref())
    }

    pub fn chain_ref(&self) -> Option<&str> {
        self.handler.as_ref().and_then(|h| h.chain.as_deref())
    }

    /// First forwarder hop address, used to synthesize a chain when a
    /// service references one that does not exist yet.
    pub fn first_forward_addr(&self) -> Option<&str> {
        self.forwarder
            .as_ref()
            .and_then(|f| f.nodes.first())
            .and_then(|n| n.addr.as_deref())
    }

    pub fn is_managed_by(&self, tag: &str) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(crate::META_MANAGED_BY))
            .and_then(Value::as_str)
            .is_some_and(|v| v == tag)
    }

    pub fn is_paused(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(crate::META_PAUSED))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused {
            self.metadata
                .get_or_insert_with(Map::new)
                .insert(crate::META_PAUSED.to_string(), Value::Bool(true));
            return;
        }
        if let Some(meta) = self.metadata.as_mut() {
            meta.remove(crate::META_PAUSED);
            if meta.is_empty() {
                self.metadata = None;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Handler {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Forwarder {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ForwardNode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ForwardNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named route hop group referenced by a service handler. Upserted by
/// name, never deleted automatically.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Chain {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hops: Vec<Hop>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Chain {
    /// Minimal single-hop chain pointing at `addr`.
    pub fn single_hop(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            hops: vec![Hop {
                name: Some(format!("{name}_hop")),
                nodes: vec![ForwardNode {
                    name: Some("auto".to_string()),
                    addr: Some(addr.to_string()),
                    extra: Map::new(),
                }],
                extra: Map::new(),
            }],
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Hop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<ForwardNode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Extract the port from a bind address. Tolerates `":8080"`,
/// `"0.0.0.0:8080"` and `"[::]:8080"`; returns 0 when none is found.
pub fn parse_port(addr: &str) -> u16 {
    let a = addr.trim();
    if a.is_empty() {
        return 0;
    }
    if a.starts_with('[') {
        return a
            .rfind("]:")
            .and_then(|i| a[i + 2..].parse().ok())
            .unwrap_or(0);
    }
    a.rfind(':')
        .and_then(|i| a[i + 1..].parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_port_formats() {
        assert_eq!(parse_port(":8080"), 8080);
        assert_eq!(parse_port("0.0.0.0:8080"), 8080);
        assert_eq!(parse_port("[::]:9000"), 9000);
        assert_eq!(parse_port("[2001:db8::1]:443"), 443);
        assert_eq!(parse_port("no-port"), 0);
        assert_eq!(parse_port(""), 0);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = json!({
            "name": "web",
            "addr": ":8080",
            "handler": {"type": "http", "auth": {"username": "u"}},
            "listener": {"type": "tcp"},
            "observer": "obs-0"
        });
        let spec: ServiceSpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.handler_type(), Some("http"));
        assert!(spec.extra.contains_key("listener"));

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back.get("observer"), raw.get("observer"));
        assert_eq!(
            back.pointer("/handler/auth/username"),
            raw.pointer("/handler/auth/username")
        );
    }

    #[test]
    fn pause_toggle_drops_empty_metadata() {
        let mut spec = ServiceSpec {
            name: "s".into(),
            ..Default::default()
        };
        assert!(!spec.is_paused());
        spec.set_paused(true);
        assert!(spec.is_paused());
        spec.set_paused(false);
        assert!(spec.metadata.is_none());
    }

    #[test]
    fn managed_tag_checked_exactly() {
        let spec: ServiceSpec = serde_json::from_value(json!({
            "name": "s",
            "metadata": {"managedBy": crate::MANAGED_BY_TAG}
        }))
        .unwrap();
        assert!(spec.is_managed_by(crate::MANAGED_BY_TAG));
        assert!(!spec.is_managed_by("someone-else"));
    }

    #[test]
    fn single_hop_chain_shape() {
        let c = Chain::single_hop("relay", "10.0.0.1:8443");
        assert_eq!(c.hops.len(), 1);
        assert_eq!(c.hops[0].nodes[0].addr.as_deref(), Some("10.0.0.1:8443"));
    }
}
