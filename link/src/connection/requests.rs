//! Transmission of prepared invocations.

use super::ConnectionInner;
use crate::{
    error::{HassLinkError, Result},
    models::{AllowedKinds, ClientMessage, HttpMethod, JsonMap, RequestIdentifier, RequestType},
    multiplexer::{Invocation, MultiplexerDelegate},
};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Payload field carrying base64-encoded binary stream data.
const BINARY_STREAM_FIELD: &str = "audio_data";

impl MultiplexerDelegate for ConnectionInner {
    fn allowed_send_kinds(&self) -> AllowedKinds {
        self.response.phase().allowed_kinds()
    }

    fn did_prepare(&self, invocation: Arc<Invocation>) {
        let Some(identifier) = invocation.identifier() else {
            return;
        };
        let request = invocation.request();

        match &request.kind {
            RequestType::WebSocket(command) => {
                let text = ClientMessage::Command {
                    identifier,
                    command: command.clone(),
                    data: request.data.clone(),
                }
                .to_text();
                self.handlers.emit_send(&text);
                self.write_text(text);
            },
            RequestType::BinaryStream(handler_id) => {
                self.write_binary_stream(identifier, *handler_id, &request.data);
            },
            RequestType::Rest { method, path } => {
                self.send_rest(identifier, *method, path.clone(), request.data.clone());
            },
        }
    }
}

impl ConnectionInner {
    pub(super) fn write_text(&self, text: String) {
        let Some(transport) = self.current_transport() else {
            log::debug!("[hass-link] No transport, frame not sent");
            return;
        };
        transport.write_text(
            text,
            Box::new(|result| {
                if let Err(e) = result {
                    log::warn!("[hass-link] Failed to send frame: {}", e);
                }
            }),
        );
    }

    /// Binary frames complete with an empty success once written.
    fn write_binary_stream(&self, identifier: RequestIdentifier, handler_id: u8, data: &JsonMap) {
        let payload = match binary_stream_payload(handler_id, data) {
            Ok(payload) => payload,
            Err(e) => {
                self.complete(identifier, Err(e));
                return;
            },
        };
        let Some(transport) = self.current_transport() else {
            log::debug!("[hass-link] No transport, binary frame not sent");
            return;
        };

        let weak_self = self.weak_self.clone();
        let callback_queue = self.callback_queue.clone();
        transport.write_binary(
            payload,
            Box::new(move |result| {
                callback_queue.dispatch(move || {
                    if let Some(inner) = weak_self.upgrade() {
                        let result = result.map(|()| JsonValue::Object(JsonMap::new()));
                        inner.complete(identifier, result);
                    }
                });
            }),
        );
    }

    fn send_rest(
        &self,
        identifier: RequestIdentifier,
        method: HttpMethod,
        path: String,
        body: JsonMap,
    ) {
        let configuration = self.configuration.clone();
        let rest_channel = self.rest_channel.clone();
        let callback_queue = self.callback_queue.clone();
        let weak_self = self.weak_self.clone();

        tokio::spawn(async move {
            let result = async {
                let endpoint = configuration.current_endpoint().ok_or_else(|| {
                    HassLinkError::ConfigurationError("No endpoint configured".to_string())
                })?;
                let token = configuration.fetch_auth_token().await?;
                rest_channel.send(&endpoint, &token, method, &path, body).await
            }
            .await;

            callback_queue.dispatch(move || {
                if let Some(inner) = weak_self.upgrade() {
                    inner.complete(identifier, result);
                }
            });
        });
    }
}

/// `[handler_id] ++ base64-decode(data["audio_data"])`. A missing field yields
/// just the handler byte, which ends the stream.
pub(crate) fn binary_stream_payload(handler_id: u8, data: &JsonMap) -> Result<Bytes> {
    let decoded = match data.get(BINARY_STREAM_FIELD) {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::String(encoded)) => general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| {
                HassLinkError::internal(format!("Invalid {}: {}", BINARY_STREAM_FIELD, e))
            })?,
        Some(other) => {
            return Err(HassLinkError::internal(format!(
                "{} must be a base64 string, got {}",
                BINARY_STREAM_FIELD, other
            )))
        },
    };

    let mut payload = Vec::with_capacity(decoded.len() + 1);
    payload.push(handler_id);
    payload.extend_from_slice(&decoded);
    Ok(Bytes::from(payload))
}
