use serde_json::Value;

use crate::envelope::{DecodeError, Envelope};
use crate::service::ServiceSpec;

/// Diagnose parameters. `mode` selects tcp (default), icmp, or iperf3;
/// `ctx` is opaque caller context echoed back in the reply.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub server: bool,
    #[serde(default)]
    pub client: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryServicesRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Name list carried by delete/pause/resume commands.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceNames {
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UpgradeRequest {
    /// Optional target version hint, e.g. `conduit-agent-0.2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// The closed command set pushed to agents. Unknown envelope types map to
/// [`Command::Unknown`] and are ignored by dispatchers.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Diagnose(DiagnoseRequest),
    AddService(Vec<ServiceSpec>),
    UpdateService(Vec<ServiceSpec>),
    DeleteService(ServiceNames),
    PauseService(ServiceNames),
    ResumeService(ServiceNames),
    QueryServices(QueryServicesRequest),
    UpgradeAgent(UpgradeRequest),
    UpgradeAgent1,
    UpgradeAgent2,
    Unknown(String),
}

impl Command {
    pub fn kind(&self) -> &str {
        match self {
            Command::Diagnose(_) => "Diagnose",
            Command::AddService(_) => "AddService",
            Command::UpdateService(_) => "UpdateService",
            Command::DeleteService(_) => "DeleteService",
            Command::PauseService(_) => "PauseService",
            Command::ResumeService(_) => "ResumeService",
            Command::QueryServices(_) => "QueryServices",
            Command::UpgradeAgent(_) => "UpgradeAgent",
            Command::UpgradeAgent1 => "UpgradeAgent1",
            Command::UpgradeAgent2 => "UpgradeAgent2",
            Command::Unknown(kind) => kind,
        }
    }

    /// Decode a received envelope into a typed command, validating the
    /// per-variant `data` shape.
    pub fn from_envelope(env: &Envelope) -> Result<Self, DecodeError> {
        fn data<T: serde::de::DeserializeOwned + Default>(
            env: &Envelope,
        ) -> Result<T, DecodeError> {
            if env.data.is_null() {
                return Ok(T::default());
            }
            serde_json::from_value(env.data.clone()).map_err(|source| {
                DecodeError::InvalidPayload {
                    kind: env.kind.clone(),
                    source,
                }
            })
        }

        Ok(match env.kind.as_str() {
            "Diagnose" => Command::Diagnose(data(env)?),
            "AddService" => Command::AddService(data(env)?),
            "UpdateService" => Command::UpdateService(data(env)?),
            "DeleteService" => Command::DeleteService(data(env)?),
            "PauseService" => Command::PauseService(data(env)?),
            "ResumeService" => Command::ResumeService(data(env)?),
            "QueryServices" => Command::QueryServices(data(env)?),
            "UpgradeAgent" => Command::UpgradeAgent(data(env)?),
            "UpgradeAgent1" => Command::UpgradeAgent1,
            "UpgradeAgent2" => Command::UpgradeAgent2,
            other => Command::Unknown(other.to_string()),
        })
    }

    /// Encode for sending. The coordinator uses this for every outbound
    /// command frame.
    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Command::Diagnose(req) => serde_json::to_value(req),
            Command::AddService(list) | Command::UpdateService(list) => serde_json::to_value(list),
            Command::DeleteService(names)
            | Command::PauseService(names)
            | Command::ResumeService(names) => serde_json::to_value(names),
            Command::QueryServices(req) => serde_json::to_value(req),
            Command::UpgradeAgent(req) => serde_json::to_value(req),
            Command::UpgradeAgent1 | Command::UpgradeAgent2 | Command::Unknown(_) => {
                Ok(Value::Null)
            }
        }
        .unwrap_or(Value::Null);
        Envelope::new(self.kind(), data)
    }

    /// Service mutations are broadcast to every connection of a node;
    /// everything else targets a single connection.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Command::AddService(_)
                | Command::UpdateService(_)
                | Command::DeleteService(_)
                | Command::PauseService(_)
                | Command::ResumeService(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::decode_frame;
    use serde_json::json;

    #[test]
    fn diagnose_round_trip() {
        let env = Envelope::new(
            "Diagnose",
            json!({"requestId": "r1", "host": "1.2.3.4", "port": 443, "mode": "tcp", "count": 3}),
        );
        let cmd = Command::from_envelope(&env).unwrap();
        let Command::Diagnose(req) = &cmd else {
            panic!("wrong variant: {cmd:?}");
        };
        assert_eq!(req.request_id, "r1");
        assert_eq!(req.port, 443);
        assert_eq!(req.count, 3);

        let back = cmd.to_envelope();
        assert_eq!(back.kind, "Diagnose");
        assert_eq!(back.data.get("requestId"), Some(&json!("r1")));
    }

    #[test]
    fn add_service_decodes_descriptor_list() {
        let env = Envelope::new(
            "AddService",
            json!([{"name": "web", "addr": ":8080", "handler": {"type": "http"}}]),
        );
        let Command::AddService(list) = Command::from_envelope(&env).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "web");
    }

    #[test]
    fn add_service_rejects_non_list_data() {
        let env = Envelope::new("AddService", json!({"name": "web"}));
        assert!(matches!(
            Command::from_envelope(&env),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn null_data_maps_to_defaults() {
        let env = Envelope::new("QueryServices", Value::Null);
        let Command::QueryServices(req) = Command::from_envelope(&env).unwrap() else {
            panic!("wrong variant");
        };
        assert!(req.request_id.is_empty());
        assert!(req.filter.is_none());
    }

    #[test]
    fn unknown_type_is_preserved() {
        let env = Envelope::new("FlushDns", json!({"x": 1}));
        assert_eq!(
            Command::from_envelope(&env).unwrap(),
            Command::Unknown("FlushDns".to_string())
        );
    }

    #[test]
    fn broadcast_classification() {
        assert!(Command::AddService(vec![]).is_broadcast());
        assert!(Command::DeleteService(ServiceNames::default()).is_broadcast());
        assert!(!Command::Diagnose(DiagnoseRequest::default()).is_broadcast());
        assert!(!Command::UpgradeAgent1.is_broadcast());
    }

    #[test]
    fn wire_frame_from_coordinator_decodes_at_agent() {
        let text = Command::DeleteService(ServiceNames {
            services: vec!["a".into(), "b".into()],
        })
        .to_envelope()
        .to_text();
        let env = decode_frame(text.as_bytes()).unwrap();
        let Command::DeleteService(names) = Command::from_envelope(&env).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(names.services, vec!["a", "b"]);
    }
}
