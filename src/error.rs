use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error payload carried by a `pusher:error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("pusher error {code}: {message}")]
pub struct EventError {
    pub code: u32,
    pub message: String,
}

/// Errors produced by the client.
///
/// Reconnection lifecycle notices (`Reconnecting`, `Reconnected`,
/// `ReconnectFailed`) and `PongTimeout` are only ever delivered through the
/// error sink; the session keeps running while they are emitted.
#[derive(Debug, Error)]
pub enum PusherError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel authorization failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid presence channel name, must start with 'presence-': {0}")]
    InvalidChannelName(String),

    #[error("pong timeout occurred, failure count: {0}")]
    PongTimeout(u32),

    #[error("not connected")]
    NotConnected,

    #[error("attempting reconnection after {0:?}")]
    Reconnecting(Duration),

    #[error("reconnection successful")]
    Reconnected,

    #[error("reconnection failed: {0}")]
    ReconnectFailed(Box<PusherError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_error_decodes_and_displays() {
        let err: EventError = serde_json::from_str(r#"{"code":4001,"message":"bad key"}"#).unwrap();
        assert_eq!(
            err,
            EventError {
                code: 4001,
                message: "bad key".to_string()
            }
        );
        assert_eq!(err.to_string(), "pusher error 4001: bad key");
    }

    #[test]
    fn reconnect_failed_includes_cause() {
        let err = PusherError::ReconnectFailed(Box::new(PusherError::Protocol("eof".into())));
        assert_eq!(err.to_string(), "reconnection failed: protocol error: eof");
    }
}
