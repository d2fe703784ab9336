use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{HassLinkError, Result};

use super::request::RequestIdentifier;

/// WebSocket message types sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after connecting; the client must answer with `auth`.
    AuthRequired {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },

    /// Authentication accepted; command frames may now be sent.
    AuthOk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ha_version: Option<String>,
    },

    /// Authentication rejected; the server closes the socket next.
    AuthInvalid {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Reply to a command frame.
    Result {
        id: RequestIdentifier,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<JsonValue>,
    },

    /// An event for a live subscription.
    Event {
        id: RequestIdentifier,
        event: JsonValue,
    },

    /// Reply to a `ping` command.
    Pong {
        id: RequestIdentifier,
    },
}

/// Outcome of the authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    Required,
    Ok { version: String },
    Invalid { message: Option<String> },
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WebSocketResponse {
    Auth(AuthResponse),
    /// `Err` carries the raw `error` payload; see [`ExternalError::from_value`].
    ///
    /// [`ExternalError::from_value`]: crate::error::ExternalError::from_value
    Result {
        identifier: RequestIdentifier,
        result: std::result::Result<JsonValue, JsonValue>,
    },
    Event {
        identifier: RequestIdentifier,
        data: JsonValue,
    },
}

impl From<ServerMessage> for WebSocketResponse {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::AuthRequired { .. } => WebSocketResponse::Auth(AuthResponse::Required),
            ServerMessage::AuthOk { ha_version } => WebSocketResponse::Auth(AuthResponse::Ok {
                version: ha_version.unwrap_or_default(),
            }),
            ServerMessage::AuthInvalid { message } => {
                WebSocketResponse::Auth(AuthResponse::Invalid { message })
            },
            ServerMessage::Result {
                id,
                success,
                result,
                error,
            } => {
                let result = if success {
                    Ok(result.unwrap_or(JsonValue::Null))
                } else {
                    Err(error.unwrap_or(JsonValue::Null))
                };
                WebSocketResponse::Result {
                    identifier: id,
                    result,
                }
            },
            ServerMessage::Event { id, event } => WebSocketResponse::Event {
                identifier: id,
                data: event,
            },
            ServerMessage::Pong { id } => WebSocketResponse::Result {
                identifier: id,
                result: Ok(JsonValue::Object(Map::new())),
            },
        }
    }
}

/// Parse a text frame into a [`WebSocketResponse`].
///
/// Malformed JSON, an unknown `type` or a missing `id` is an error; callers log
/// and drop the frame.
pub fn parse_message(text: &str) -> Result<WebSocketResponse> {
    serde_json::from_str::<ServerMessage>(text)
        .map(WebSocketResponse::from)
        .map_err(|e| HassLinkError::InternalError(format!("Unparseable frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_auth_frames() {
        assert_eq!(
            parse_message(r#"{"type":"auth_required","ha_version":"2024.1.0"}"#).unwrap(),
            WebSocketResponse::Auth(AuthResponse::Required)
        );
        assert_eq!(
            parse_message(r#"{"type":"auth_ok","ha_version":"2024.1.0"}"#).unwrap(),
            WebSocketResponse::Auth(AuthResponse::Ok {
                version: "2024.1.0".to_string()
            })
        );
        assert_eq!(
            parse_message(r#"{"type":"auth_invalid","message":"bad token"}"#).unwrap(),
            WebSocketResponse::Auth(AuthResponse::Invalid {
                message: Some("bad token".to_string())
            })
        );
    }

    #[test]
    fn test_parse_success_result() {
        let parsed =
            parse_message(r#"{"id":1,"type":"result","success":true,"result":{"ok":true}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            WebSocketResponse::Result {
                identifier: RequestIdentifier::new(1),
                result: Ok(json!({"ok": true})),
            }
        );
    }

    #[test]
    fn test_parse_success_without_result_is_null() {
        let parsed = parse_message(r#"{"id":2,"type":"result","success":true}"#).unwrap();
        assert_eq!(
            parsed,
            WebSocketResponse::Result {
                identifier: RequestIdentifier::new(2),
                result: Ok(JsonValue::Null),
            }
        );
    }

    #[test]
    fn test_parse_failure_result_keeps_error_payload() {
        let parsed = parse_message(
            r#"{"id":4,"type":"result","success":false,"error":{"code":"not_found","message":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            WebSocketResponse::Result {
                identifier: RequestIdentifier::new(4),
                result: Err(json!({"code": "not_found", "message": "x"})),
            }
        );
    }

    #[test]
    fn test_parse_event() {
        let parsed = parse_message(r#"{"id":9,"type":"event","event":{"a":1}}"#).unwrap();
        assert_eq!(
            parsed,
            WebSocketResponse::Event {
                identifier: RequestIdentifier::new(9),
                data: json!({"a": 1}),
            }
        );
    }

    #[test]
    fn test_pong_is_empty_success() {
        let parsed = parse_message(r#"{"id":5,"type":"pong"}"#).unwrap();
        assert_eq!(
            parsed,
            WebSocketResponse::Result {
                identifier: RequestIdentifier::new(5),
                result: Ok(json!({})),
            }
        );
    }

    #[test]
    fn test_parse_failures() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message(r#"{"type":"mystery","id":1}"#).is_err());
        assert!(parse_message(r#"{"type":"event","event":{}}"#).is_err());
        assert!(parse_message(r#"{"type":"result","success":true}"#).is_err());
        assert!(parse_message(r#"{"id":1}"#).is_err());
    }
}
