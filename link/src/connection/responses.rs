//! Phase handling and routing of parsed responses.

use super::ConnectionInner;
use crate::{
    error::{ExternalError, HassLinkError, Result},
    event_handlers::ConnectionError,
    models::{AuthResponse, ClientMessage, Request, RequestIdentifier, WebSocketResponse},
    response::{ConnectionPhase, ResponseDelegate},
};
use serde_json::Value as JsonValue;
use std::sync::atomic::Ordering;

/// Error code used when the server rejects the access token.
pub const AUTH_INVALID_CODE: &str = "auth_invalid";

impl ResponseDelegate for ConnectionInner {
    fn did_transition(&self, phase: ConnectionPhase) {
        match &phase {
            ConnectionPhase::Authenticating => self.authenticate(),
            ConnectionPhase::Command { .. } => {
                self.link.mutate(|link| link.connecting = false);
                self.reconnect.did_finish_connect();
                self.multiplexer.prepare();
            },
            ConnectionPhase::Disconnected { error, for_reset } => {
                self.multiplexer.reset_active();
                if !for_reset {
                    let requested = self
                        .link
                        .mutate(|link| {
                            link.connecting = false;
                            link.disconnect_requested
                        })
                        .into_inner();
                    if let Some(error) = error {
                        log::warn!("[hass-link] Disconnected: {}", error);
                    }
                    if self.options.auto_reconnect && !requested {
                        self.reconnect.did_disconnect_temporarily(error.clone());
                    } else {
                        self.reconnect.did_disconnect_permanently();
                    }
                }
            },
        }

        self.notify_state();
        self.notify_phase_observers(&phase);
    }

    fn did_receive(&self, response: WebSocketResponse) {
        match response {
            WebSocketResponse::Auth(AuthResponse::Invalid { message }) => {
                let message = message.unwrap_or_else(|| "Invalid access token".to_string());
                log::warn!("[hass-link] Authentication rejected: {}", message);
                self.handlers.emit_error(ConnectionError::new(
                    format!("Authentication rejected: {}", message),
                    true,
                ));
                self.disconnect_temporarily(
                    ExternalError::new(AUTH_INVALID_CODE, message).into(),
                );
            },
            WebSocketResponse::Auth(AuthResponse::Required | AuthResponse::Ok { .. }) => {},
            WebSocketResponse::Result { identifier, result } => {
                let result = result.map_err(|error| ExternalError::from_value(&error).into());
                self.complete(identifier, result);
            },
            WebSocketResponse::Event { identifier, data } => self.deliver_event(identifier, data),
        }
    }
}

impl ConnectionInner {
    /// Fetch a token and answer the server's `auth_required`.
    fn authenticate(&self) {
        let attempt = self.auth_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let configuration = self.configuration.clone();
        let callback_queue = self.callback_queue.clone();
        let weak_self = self.weak_self.clone();

        tokio::spawn(async move {
            let token = configuration.fetch_auth_token().await;
            callback_queue.dispatch(move || {
                if let Some(inner) = weak_self.upgrade() {
                    inner.did_fetch_token(attempt, token);
                }
            });
        });
    }

    fn did_fetch_token(&self, attempt: u64, token: Result<String>) {
        let current = attempt == self.auth_attempt.load(Ordering::SeqCst)
            && matches!(self.response.phase(), ConnectionPhase::Authenticating);
        if !current {
            log::debug!("[hass-link] Discarding token for a superseded handshake");
            return;
        }

        match token {
            Ok(access_token) => {
                log::debug!("[hass-link] Sending auth");
                self.write_text(ClientMessage::Auth { access_token }.to_text());
            },
            Err(error) => {
                log::warn!("[hass-link] Failed to fetch access token: {}", error);
                self.handlers
                    .emit_error(ConnectionError::new(error.to_string(), true));
                self.disconnect_temporarily(error);
            },
        }
    }

    /// Resolve whatever is waiting on `identifier`.
    pub(super) fn complete(&self, identifier: RequestIdentifier, result: Result<JsonValue>) {
        if let Some(invocation) = self.multiplexer.single(identifier) {
            self.multiplexer.clear(&invocation);
            if let Some(completion) = invocation.take_completion() {
                completion(result);
            }
        } else if let Some(invocation) = self.multiplexer.subscription(identifier) {
            invocation.set_needs_retry(result.is_err());
            if let Err(error) = &result {
                log::info!(
                    "[hass-link] Subscription {} failed to start: {}",
                    identifier,
                    error
                );
            }
            if let Some(initiated) = invocation.initiated() {
                initiated(result);
            }
        } else {
            log::debug!("[hass-link] No request waiting on {}", identifier);
        }
    }

    fn deliver_event(&self, identifier: RequestIdentifier, data: JsonValue) {
        match self.multiplexer.subscription(identifier) {
            Some(invocation) => {
                if let Some(handler) = invocation.event_handler() {
                    handler(self.cancellable_for(invocation), data);
                }
            },
            None => {
                log::info!(
                    "[hass-link] Event for unknown subscription {}, unsubscribing",
                    identifier
                );
                let _ = self.send(Request::unsubscribe(identifier), Box::new(|_| {}));
            },
        }
    }
}

/// Whether `error` is the server rejecting the access token.
pub fn is_auth_invalid(error: &HassLinkError) -> bool {
    error
        .as_external()
        .is_some_and(|external| external.code == AUTH_INVALID_CODE)
}
