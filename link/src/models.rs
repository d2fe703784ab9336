//! Data models for the hass-link client library.
//!
//! Defines requests, wire frames in both directions and connection options.

pub mod client_message;
pub mod connection_options;
pub mod request;
pub mod server_message;


pub use client_message::ClientMessage;
pub use connection_options::ConnectionOptions;
pub use request::{
    AllowedKinds, HttpMethod, JsonMap, Request, RequestIdentifier, RequestKind, RequestType,
};
pub use server_message::{parse_message, AuthResponse, ServerMessage, WebSocketResponse};
