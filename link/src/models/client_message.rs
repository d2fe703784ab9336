use serde_json::{json, Value as JsonValue};

use super::request::{JsonMap, RequestIdentifier};

/// Client-to-server WebSocket messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Sent once per authenticating phase.
    Auth {
        access_token: String,
    },

    /// A command frame: `{"id": n, "type": command, ...data}`.
    ///
    /// `id` and `type` always win over same-named payload fields.
    Command {
        identifier: RequestIdentifier,
        command: String,
        data: JsonMap,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> JsonValue {
        match self {
            ClientMessage::Auth { access_token } => json!({
                "type": "auth",
                "access_token": access_token,
            }),
            ClientMessage::Command {
                identifier,
                command,
                data,
            } => {
                let mut frame = data.clone();
                frame.insert("id".to_string(), JsonValue::from(identifier.get()));
                frame.insert("type".to_string(), JsonValue::from(command.as_str()));
                JsonValue::Object(frame)
            },
        }
    }

    /// Serialize to the text sent on the socket.
    pub fn to_text(&self) -> String {
        self.to_json().to_string()
    }
}
