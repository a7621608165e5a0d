use serde_json::Value;

pub const REPLY_DIAGNOSE_RESULT: &str = "DiagnoseResult";
pub const REPLY_QUERY_SERVICES_RESULT: &str = "QueryServicesResult";

/// Reply envelope written back over the connection a command arrived on.
/// Unlike plain envelopes, the correlation id rides at the top level.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    #[serde(default)]
    pub data: Value,
}

impl ReplyFrame {
    pub fn diagnose_result(request_id: impl Into<String>, report: &DiagnoseReport) -> Self {
        Self {
            kind: REPLY_DIAGNOSE_RESULT.to_string(),
            request_id: request_id.into(),
            data: serde_json::to_value(report).unwrap_or(Value::Null),
        }
    }

    pub fn query_services_result(
        request_id: impl Into<String>,
        services: &[ServiceSummary],
    ) -> Self {
        Self {
            kind: REPLY_QUERY_SERVICES_RESULT.to_string(),
            request_id: request_id.into(),
            data: serde_json::to_value(services).unwrap_or(Value::Null),
        }
    }

    pub fn is_reply_kind(kind: &str) -> bool {
        matches!(kind, REPLY_DIAGNOSE_RESULT | REPLY_QUERY_SERVICES_RESULT)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Structured diagnostics outcome. Measurement fields are filled per
/// mode; `ctx` echoes the caller-supplied context untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnoseReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<Value>,
}

/// One line of a QueryServices reply: the declared entry plus a live
/// reachability probe of its bound port.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceSummary {
    pub name: String,
    pub addr: String,
    pub handler: String,
    pub port: u16,
    pub listening: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rlimiter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnose_reply_wire_shape() {
        let report = DiagnoseReport {
            success: false,
            message: Some("connect fail".to_string()),
            average_time: Some(0),
            packet_loss: Some(100),
            ctx: Some(serde_json::json!({"k": "v"})),
            ..Default::default()
        };
        let frame = ReplyFrame::diagnose_result("req-1", &report);
        let v: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(v["type"], "DiagnoseResult");
        assert_eq!(v["requestId"], "req-1");
        assert_eq!(v["data"]["packetLoss"], 100);
        assert_eq!(v["data"]["ctx"]["k"], "v");
    }

    #[test]
    fn reply_kind_classification() {
        assert!(ReplyFrame::is_reply_kind(REPLY_DIAGNOSE_RESULT));
        assert!(ReplyFrame::is_reply_kind(REPLY_QUERY_SERVICES_RESULT));
        assert!(!ReplyFrame::is_reply_kind("Diagnose"));
    }
}
