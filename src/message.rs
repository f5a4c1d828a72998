//! Payload structures carried inside protocol frames.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `pusher:connection_established` payload (double-encoded).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ConnectionInfo {
    pub socket_id: String,
    /// Seconds of idle time before the client should ping. Absent on some
    /// servers; the protocol default applies then.
    #[serde(default)]
    pub activity_timeout: Option<u64>,
}

/// `pusher:subscribe` payload.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct SubscribeData {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_data: Option<String>,
}

/// `pusher:unsubscribe` payload.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct UnsubscribeData {
    pub channel: String,
}

/// Body returned by the authorization endpoint. `channel_data` is only
/// present for presence channels.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AuthResponse {
    pub auth: String,
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// A member of a presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "user_id")]
    pub id: String,
    #[serde(rename = "user_info", default)]
    pub info: Value,
}

/// Roster carried by `pusher_internal:subscription_succeeded` on presence
/// channels.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PresenceData {
    #[serde(default)]
    pub hash: HashMap<String, Value>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubscriptionSucceededData {
    #[serde(default)]
    pub presence: Option<PresenceData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::from_data_string;
    use serde_json::json;

    #[test]
    fn subscribe_data_omits_absent_auth_fields() {
        let data = SubscribeData {
            channel: "orders".to_string(),
            auth: None,
            channel_data: None,
        };
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"channel":"orders"}"#
        );
    }

    #[test]
    fn member_decodes_with_and_without_info() {
        let member: Member =
            serde_json::from_str(r#"{"user_id":"1","user_info":{"name":"name-1"}}"#).unwrap();
        assert_eq!(member.id, "1");
        assert_eq!(member.info, json!({"name": "name-1"}));

        let bare: Member = serde_json::from_str(r#"{"user_id":"2"}"#).unwrap();
        assert_eq!(bare.id, "2");
        assert_eq!(bare.info, Value::Null);
    }

    #[test]
    fn presence_roster_decodes_from_double_encoded_data() {
        let inner = json!({
            "presence": {
                "ids": ["1", "2"],
                "hash": {"1": {"name": "name-1"}, "2": {"name": "name-2"}},
                "count": 2
            }
        });
        let data = Value::String(inner.to_string());
        let decoded: SubscriptionSucceededData = from_data_string(&data).unwrap();
        let presence = decoded.presence.unwrap();
        assert_eq!(presence.count, 2);
        assert_eq!(presence.hash.len(), 2);
        assert_eq!(presence.hash["1"], json!({"name": "name-1"}));
    }
}
