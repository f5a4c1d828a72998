//! Wire frame representation and the double-encoded payload convention.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::error::PusherError;

/// Protocol event names.
pub(crate) mod protocol {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher:subscription_succeeded";
    pub const INTERNAL_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const INTERNAL_MEMBER_ADDED: &str = "pusher_internal:member_added";
    pub const INTERNAL_MEMBER_REMOVED: &str = "pusher_internal:member_removed";
}

/// A single frame on the Pusher connection.
///
/// `data` is kept as raw JSON; protocol events that carry structured data
/// double-encode it as a JSON string, see [`from_data_string`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    pub fn new(event: impl Into<String>, data: Value, channel: Option<String>) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    pub(crate) fn ping() -> Self {
        Self::new(protocol::PING, Value::String("{}".into()), None)
    }

    pub(crate) fn pong() -> Self {
        Self::new(protocol::PONG, Value::String("{}".into()), None)
    }

    pub(crate) fn from_json(text: &str) -> Result<Self, PusherError> {
        serde_json::from_str(text).map_err(|e| PusherError::Protocol(format!("malformed frame: {e}")))
    }

    pub(crate) fn to_message(&self) -> Result<Message, PusherError> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// Decode a double-encoded event payload: `data` must be a JSON string whose
/// content is itself JSON, which is parsed into `T`.
///
/// The protocol double-encodes `pusher:connection_established` and
/// `pusher_internal:*` payloads, and servers frequently double-encode
/// application event data the same way.
pub fn from_data_string<T: DeserializeOwned>(data: &Value) -> Result<T, PusherError> {
    let text = data
        .as_str()
        .ok_or_else(|| PusherError::Protocol("event data is not a JSON string".to_string()))?;
    serde_json::from_str(text)
        .map_err(|e| PusherError::Protocol(format!("failed to decode data string: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_frame_with_channel() {
        let event = Event::from_json(r#"{"event":"foo","channel":"bar","data":{"hello":"world"}}"#)
            .unwrap();
        assert_eq!(event.event, "foo");
        assert_eq!(event.channel.as_deref(), Some("bar"));
        assert_eq!(event.data, json!({"hello": "world"}));
    }

    #[test]
    fn decodes_frame_without_channel_or_data() {
        let event = Event::from_json(r#"{"event":"pusher:pong"}"#).unwrap();
        assert_eq!(event.event, "pusher:pong");
        assert_eq!(event.channel, None);
        assert_eq!(event.data, Value::Null);
    }

    #[test]
    fn encoding_omits_absent_channel() {
        let frame = serde_json::to_string(&Event::ping()).unwrap();
        assert_eq!(frame, r#"{"event":"pusher:ping","data":"{}"}"#);
    }

    #[test]
    fn from_data_string_decodes_double_encoded_payload() {
        let data = Value::String(r#"{"foo":"A","bar":1}"#.to_string());
        let dest: HashMap<String, Value> = from_data_string(&data).unwrap();
        assert_eq!(dest["foo"], json!("A"));
        assert_eq!(dest["bar"], json!(1));
    }

    #[test]
    fn from_data_string_rejects_non_string_data() {
        let err = from_data_string::<Value>(&json!({"foo": "A"})).unwrap_err();
        assert!(matches!(err, PusherError::Protocol(_)));
    }

    #[test]
    fn malformed_frame_is_a_protocol_error() {
        let err = Event::from_json("not json").unwrap_err();
        assert!(matches!(err, PusherError::Protocol(_)));
    }
}
