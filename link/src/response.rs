//! Connection phase tracking and inbound frame dispatch.
//!
//! The [`ResponseController`] turns transport events into phase transitions
//! and parsed responses. Every event is first handled on the work queue (text
//! frames are parsed there) and then hopped to the callback queue, where the
//! phase is updated and the delegate told. Malformed frames are logged and
//! dropped without touching the phase.

use crate::{
    dispatch::DispatchQueue,
    error::HassLinkError,
    event_handlers::EventHandlers,
    models::{parse_message, AllowedKinds, AuthResponse, WebSocketResponse},
    protected::Protected,
    transport::TransportEvent,
};
use std::sync::{Arc, Weak};

/// Coarse wire-protocol state of a connection.
#[derive(Debug, Clone)]
pub enum ConnectionPhase {
    /// No usable socket. `for_reset` is set when the client asked for it.
    Disconnected {
        error: Option<HassLinkError>,
        for_reset: bool,
    },
    /// Socket open, waiting for the access token to be accepted.
    Authenticating,
    /// Authenticated; commands may be sent.
    Command { version: String },
}

impl ConnectionPhase {
    pub fn is_command(&self) -> bool {
        matches!(self, ConnectionPhase::Command { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionPhase::Disconnected { .. })
    }

    /// Request kinds that may be sent in this phase.
    pub fn allowed_kinds(&self) -> AllowedKinds {
        if self.is_command() {
            AllowedKinds::ALL
        } else {
            AllowedKinds::REST_ONLY
        }
    }
}

impl Default for ConnectionPhase {
    fn default() -> Self {
        ConnectionPhase::Disconnected {
            error: None,
            for_reset: true,
        }
    }
}

/// Receives phase transitions and parsed responses on the callback queue.
pub trait ResponseDelegate: Send + Sync {
    fn did_transition(&self, phase: ConnectionPhase);

    fn did_receive(&self, response: WebSocketResponse);
}

enum Step {
    Transition(ConnectionPhase),
    Response { raw: String, response: WebSocketResponse },
    Dropped { raw: String },
}

pub struct ResponseController {
    phase: Protected<ConnectionPhase>,
    work_queue: DispatchQueue,
    callback_queue: DispatchQueue,
    handlers: EventHandlers,
    delegate: Weak<dyn ResponseDelegate>,
    weak_self: Weak<ResponseController>,
}

impl ResponseController {
    pub fn new(
        work_queue: DispatchQueue,
        callback_queue: DispatchQueue,
        handlers: EventHandlers,
        delegate: Weak<dyn ResponseDelegate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            phase: Protected::default(),
            work_queue,
            callback_queue,
            handlers,
            delegate,
            weak_self: weak_self.clone(),
        })
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase.read(Clone::clone)
    }

    /// Feed one transport event through the work and callback queues.
    pub fn did_receive_event(&self, event: TransportEvent) {
        let weak_self = self.weak_self.clone();
        let callback_queue = self.callback_queue.clone();

        self.work_queue.dispatch(move || {
            let step = match event {
                TransportEvent::Text(raw) => match parse_message(&raw) {
                    Ok(response) => Step::Response { raw, response },
                    Err(e) => {
                        log::warn!("[hass-link] Dropping frame: {}", e);
                        Step::Dropped { raw }
                    },
                },
                TransportEvent::Connected => Step::Transition(ConnectionPhase::Authenticating),
                other => Step::Transition(ConnectionPhase::Disconnected {
                    error: other.disconnect_error(),
                    for_reset: false,
                }),
            };

            callback_queue.dispatch(move || {
                if let Some(controller) = weak_self.upgrade() {
                    controller.apply(step);
                }
            });
        });
    }

    /// Move to `Disconnected(error, for_reset: false)` without a transport event,
    /// e.g. when authentication fails.
    pub fn did_disconnect(&self, error: HassLinkError) {
        self.did_receive_event(TransportEvent::Error(error));
    }

    /// Move to `Disconnected(None, for_reset: true)`.
    pub fn reset(&self) {
        let weak_self = self.weak_self.clone();
        self.callback_queue.dispatch(move || {
            if let Some(controller) = weak_self.upgrade() {
                controller.transition(ConnectionPhase::default());
            }
        });
    }

    fn apply(&self, step: Step) {
        match step {
            Step::Transition(phase) => self.transition(phase),
            Step::Dropped { raw } => self.handlers.emit_receive(&raw),
            Step::Response { raw, response } => {
                self.handlers.emit_receive(&raw);
                if let WebSocketResponse::Auth(AuthResponse::Ok { version }) = &response {
                    log::info!("[hass-link] Authenticated, server version {}", version);
                    self.transition(ConnectionPhase::Command {
                        version: version.clone(),
                    });
                }
                if let Some(delegate) = self.delegate.upgrade() {
                    delegate.did_receive(response);
                }
            },
        }
    }

    fn transition(&self, phase: ConnectionPhase) {
        log::debug!("[hass-link] Phase -> {:?}", phase);
        self.phase.mutate(|current| *current = phase.clone());
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.did_transition(phase);
        }
    }
}
