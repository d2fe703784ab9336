//! Connection lifecycle event handlers.
//!
//! Provides callback-based hooks for monitoring a [`Connection`]:
//!
//! - [`on_state_change`](EventHandlers::on_state_change): Fired whenever the observable
//!   [`ConnectionState`] changes (connecting, authenticating, ready, disconnected)
//! - [`on_error`](EventHandlers::on_error): Fired on transport, authentication or protocol errors
//! - [`on_receive`](EventHandlers::on_receive): Optional debug hook for all incoming text frames
//! - [`on_send`](EventHandlers::on_send): Optional debug hook for all outgoing text frames
//!
//! Every handler runs on the connection's callback queue.
//!
//! # Example
//!
//! ```rust
//! use hass_link::{ConnectionState, EventHandlers};
//!
//! let handlers = EventHandlers::new()
//!     .on_state_change(|state| {
//!         if let ConnectionState::Ready { version } = state {
//!             println!("Connected to server {}", version);
//!         }
//!     })
//!     .on_error(|error| {
//!         eprintln!("Connection error: {}", error);
//!     });
//! ```
//!
//! [`Connection`]: crate::Connection

use crate::connection::ConnectionState;
use std::fmt;
use std::sync::Arc;

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// Human-readable error message.
    pub message: String,
    /// Whether this error is recoverable (i.e. auto-reconnect may succeed).
    pub recoverable: bool,
}

impl ConnectionError {
    /// Create a new connection error.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Type alias for the on_state_change callback.
pub type OnStateChangeCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Type alias for the on_receive callback (debug hook for all inbound frames).
pub type OnReceiveCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Type alias for the on_send callback (debug hook for all outbound frames).
pub type OnSendCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional. The builder pattern makes it easy to register
/// only the handlers you need.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_state_change: Option<OnStateChangeCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_receive: Option<OnReceiveCallback>,
    pub(crate) on_send: Option<OnSendCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked whenever the connection state may have changed.
    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a connection error occurs.
    ///
    /// # Example
    /// ```rust
    /// use hass_link::EventHandlers;
    ///
    /// let handlers = EventHandlers::new()
    ///     .on_error(|err| eprintln!("Error (recoverable={}): {}", err.recoverable, err));
    /// ```
    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw text frame received from the server,
    /// before parsing. Debug/tracing only.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked for every raw text frame sent to the server.
    /// Debug/tracing only.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_state_change.is_some()
            || self.on_error.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_state_change(&self, state: ConnectionState) {
        if let Some(cb) = &self.on_state_change {
            cb(state);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_empty_handlers() {
        let handlers = EventHandlers::new();
        assert!(!handlers.has_any());
        // Emitting with nothing registered is a no-op.
        handlers.emit_error(ConnectionError::new("x", true));
        handlers.emit_receive("{}");
    }

    #[test]
    fn test_registered_handlers_fire() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
        let handlers = EventHandlers::new()
            .on_error(move |e| a.lock().unwrap().push(format!("error:{}", e)))
            .on_receive(move |raw| b.lock().unwrap().push(format!("recv:{}", raw)))
            .on_send(move |raw| c.lock().unwrap().push(format!("send:{}", raw)));
        assert!(handlers.has_any());

        handlers.emit_send("out");
        handlers.emit_receive("in");
        handlers.emit_error(ConnectionError::new("boom", false));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["send:out", "recv:in", "error:boom"]
        );
    }

    #[test]
    fn test_debug_lists_registered_handlers() {
        let handlers = EventHandlers::new().on_state_change(|_| {});
        let debug = format!("{:?}", handlers);
        assert!(debug.contains("on_state_change: true"));
        assert!(debug.contains("on_error: false"));
    }
}
