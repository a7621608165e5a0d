use serde_json::Value;

/// The canonical `{type, data}` wrapper around every protocol message.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// None of the fallback strategies produced an envelope. The frame is
    /// logged and dropped by callers; it never tears down the connection.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// The envelope decoded but its `data` did not match the command's
    /// expected shape.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode an arbitrary transport payload into an [`Envelope`].
///
/// Strategies are tried in a fixed order with early return:
///  1. canonical `{type, data}` decode
///  2. loose decode where `data` is an open key/value map, re-encoded
///  3. the payload is itself a JSON string (double-encoded); decode it
///     and re-apply 1-2, then the brace scan, to its contents
///  4. brace scan: first `{` to last `}` of the raw text, then 1
pub fn decode_frame(payload: &[u8]) -> Result<Envelope, DecodeError> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim().replace('\n', " ");
    decode_text(&text).ok_or_else(|| DecodeError::MalformedPayload(snippet(&text)))
}

fn decode_text(text: &str) -> Option<Envelope> {
    const STRATEGIES: &[fn(&str) -> Option<Envelope>] = &[
        decode_canonical,
        decode_loose,
        decode_quoted,
        decode_braced,
    ];
    STRATEGIES.iter().find_map(|strategy| strategy(text))
}

fn decode_canonical(text: &str) -> Option<Envelope> {
    let env: Envelope = serde_json::from_str(text).ok()?;
    if env.kind.is_empty() {
        return None;
    }
    Some(env)
}

/// Some senders wrap `data` in an extra object layer with unknown keys.
/// Accept any object-shaped `data` and re-encode it into the canonical
/// form.
fn decode_loose(text: &str) -> Option<Envelope> {
    #[derive(serde::Deserialize)]
    struct Loose {
        #[serde(rename = "type")]
        kind: String,
        data: serde_json::Map<String, Value>,
    }

    let loose: Loose = serde_json::from_str(text).ok()?;
    if loose.kind.is_empty() {
        return None;
    }
    Some(Envelope {
        kind: loose.kind,
        data: Value::Object(loose.data),
    })
}

fn decode_quoted(text: &str) -> Option<Envelope> {
    let inner: String = serde_json::from_str(text).ok()?;
    let inner = inner.trim();
    if inner.is_empty() {
        return None;
    }
    decode_canonical(inner)
        .or_else(|| decode_loose(inner))
        .or_else(|| decode_braced(inner))
}

fn decode_braced(text: &str) -> Option<Envelope> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    decode_canonical(&text[start..=end])
}

fn snippet(text: &str) -> String {
    const MAX: usize = 256;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_frame_decodes() {
        let env = decode_frame(br#"{"type":"Diagnose","data":{"host":"a"}}"#).unwrap();
        assert_eq!(env.kind, "Diagnose");
        assert_eq!(env.data, json!({"host": "a"}));
    }

    #[test]
    fn data_may_be_missing_or_non_object() {
        let env = decode_frame(br#"{"type":"UpgradeAgent1"}"#).unwrap();
        assert_eq!(env.kind, "UpgradeAgent1");
        assert_eq!(env.data, Value::Null);

        let env = decode_frame(br#"{"type":"X","data":[1,2]}"#).unwrap();
        assert_eq!(env.data, json!([1, 2]));
    }

    #[test]
    fn double_encoded_frame_decodes() {
        let inner = r#"{"type":"DeleteService","data":{"services":["web"]}}"#;
        let wrapped = serde_json::to_string(inner).unwrap();
        let env = decode_frame(wrapped.as_bytes()).unwrap();
        assert_eq!(env.kind, "DeleteService");
        assert_eq!(env.data, json!({"services": ["web"]}));
    }

    #[test]
    fn double_encoded_frame_with_noise_decodes() {
        let noisy = "log: {\"type\":\"PauseService\",\"data\":{\"services\":[]}} end";
        let wrapped = serde_json::to_string(noisy).unwrap();
        let env = decode_frame(wrapped.as_bytes()).unwrap();
        assert_eq!(env.kind, "PauseService");
    }

    #[test]
    fn raw_noise_around_braces_decodes() {
        let env = decode_frame(b"xx{\"type\":\"Diagnose\",\"data\":{}}yy").unwrap();
        assert_eq!(env.kind, "Diagnose");
    }

    #[test]
    fn embedded_newlines_are_tolerated() {
        let env = decode_frame(b"{\"type\":\"Diagnose\",\n\"data\":{}}").unwrap();
        assert_eq!(env.kind, "Diagnose");
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        assert!(decode_frame(b"not json at all").is_err());
        assert!(decode_frame(b"").is_err());
        assert!(decode_frame(b"\"just a string\"").is_err());
        assert!(decode_frame(b"{\"no_type\":1}").is_err());
    }

    #[test]
    fn strategy_order_is_deterministic() {
        // Decodable by the canonical stage: later stages must not change
        // the outcome regardless of the payload also containing braces.
        let payload = br#"{"type":"A","data":{"k":"{v}"}}"#;
        let first = decode_frame(payload).unwrap();
        for _ in 0..3 {
            assert_eq!(decode_frame(payload).unwrap(), first);
        }
    }
}
