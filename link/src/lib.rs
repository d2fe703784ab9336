//! # hass-link
//!
//! A persistent, auto-reconnecting client for the Home Assistant WebSocket
//! API.
//!
//! ## Features
//!
//! - **Requests**: one-shot commands with per-request completion callbacks
//!   (or `async` via [`Connection::send_async`])
//! - **Subscriptions**: long-lived event streams, replayed after every reconnect
//! - **Reconnect**: a single scheduled retry after a drop, with a `network_reachable` hint
//! - **REST**: "perpetual" requests over HTTP that survive socket drops
//! - **Caches**: [`Cache`] populates a value, then keeps it current from events
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hass_link::{Connection, EventHandlers, Request, StaticConfiguration};
//! use std::sync::Arc;
//!
//! # async fn example() -> hass_link::Result<()> {
//! let connection = Connection::builder(Arc::new(StaticConfiguration::new(
//!     "ws://homeassistant.local:8123/api/websocket",
//!     "long-lived-access-token",
//! )))
//! .event_handlers(EventHandlers::new().on_state_change(|state| println!("{:?}", state)))
//! .build()?;
//!
//! connection.connect();
//!
//! let config = connection.send_async(Request::new("get_config")).await?;
//! println!("Location: {}", config["location_name"]);
//!
//! let _token = connection.subscribe(Request::subscribe_events(Some("state_changed")), |_, event| {
//!     println!("Changed: {}", event["data"]["entity_id"]);
//! });
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cancellable;
pub mod clock;
pub mod configuration;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event_handlers;
pub mod models;
pub mod multiplexer;
pub mod protected;
pub mod reconnect;
pub mod reset_lock;
pub mod response;
pub mod rest;
pub mod timeouts;
pub mod transport;

pub use cache::{Cache, CacheResponse, PopulateInfo, SubscribeInfo, SubscriptionPhase};
pub use cancellable::Cancellable;
pub use clock::{Clock, ManualClock, SystemClock};
pub use configuration::{ConnectionConfiguration, StaticConfiguration};
pub use connection::{
    is_auth_invalid, Connection, ConnectionBuilder, ConnectionState, WeakConnection,
    AUTH_INVALID_CODE,
};
pub use dispatch::DispatchQueue;
pub use error::{ExternalError, HassLinkError, Result};
pub use event_handlers::{ConnectionError, EventHandlers};
pub use models::{
    AllowedKinds, ClientMessage, ConnectionOptions, HttpMethod, JsonMap, Request,
    RequestIdentifier, RequestKind, RequestType, WebSocketResponse,
};
pub use reconnect::ReconnectState;
pub use response::ConnectionPhase;
pub use rest::{HttpRestChannel, RestChannel};
pub use timeouts::HassLinkTimeouts;
pub use transport::{
    Transport, TransportEvent, TransportEventSink, TransportFactory, WebSocketTransportFactory,
    WriteCompletion,
};
