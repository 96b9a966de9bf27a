use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminated JSON text frame exchanged on every channel.
///
/// Outbound frames always carry `data`. Inbound frames carry either `data`
/// or, on the conversation channel, a server-side `error` object that the
/// transport redirects to `"<type>.error"` handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Envelope {
    /// Builds an outbound `{type, data}` frame.
    pub fn outbound(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frame_serializes_without_error_field() {
        let envelope = Envelope::outbound("conversation.main.create", json!({ "chunk_id": "0" }));
        let raw = envelope.to_json().unwrap();

        assert_eq!(
            raw,
            r#"{"type":"conversation.main.create","data":{"chunk_id":"0"}}"#
        );
    }

    #[test]
    fn inbound_error_variant_parses() {
        let envelope =
            Envelope::parse(r#"{"type":"conversation.list","error":{"message":"db down"}}"#)
                .unwrap();

        assert_eq!(envelope.event, "conversation.list");
        assert!(envelope.data.is_none());
        assert_eq!(envelope.error, Some(json!({ "message": "db down" })));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let envelope =
            Envelope::parse(r#"{"type":"x","data":{},"trace_id":"abc"}"#).unwrap();
        assert_eq!(envelope.event, "x");
    }
}
