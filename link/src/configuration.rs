//! Where to connect and how to authenticate.
//!
//! ## Dynamic configuration
//!
//! Implement [`ConnectionConfiguration`] to supply the endpoint and the access
//! token lazily. Both are consulted on every connect and reconnect, which is
//! the right choice for:
//! - tokens that expire and must be refreshed
//! - endpoints that change with the network (local vs remote URL)
//!
//! ```rust,no_run
//! use hass_link::ConnectionConfiguration;
//!
//! struct MyTokenStore { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl ConnectionConfiguration for MyTokenStore {
//!     fn current_endpoint(&self) -> Option<String> {
//!         Some("ws://homeassistant.local:8123/api/websocket".to_string())
//!     }
//!
//!     async fn fetch_auth_token(&self) -> hass_link::Result<String> {
//!         // fetch / refresh token here
//!         Ok("fresh-token".into())
//!     }
//! }
//! ```

use crate::error::{HassLinkError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Supplies the connection endpoint and access token.
#[async_trait]
pub trait ConnectionConfiguration: Send + Sync + 'static {
    /// The WebSocket URL to connect to, or `None` to stay disconnected.
    fn current_endpoint(&self) -> Option<String>;

    /// Return the current (or freshly refreshed) access token.
    async fn fetch_auth_token(&self) -> Result<String>;
}

/// A reference-counted [`ConnectionConfiguration`].
pub type ArcConnectionConfiguration = Arc<dyn ConnectionConfiguration>;

/// A fixed endpoint and token, both replaceable at runtime.
///
/// # Examples
///
/// ```rust
/// use hass_link::StaticConfiguration;
///
/// let config = StaticConfiguration::new("ws://localhost:8123/api/websocket", "token");
/// config.set_access_token("rotated");
/// ```
pub struct StaticConfiguration {
    endpoint: RwLock<Option<String>>,
    access_token: RwLock<Option<String>>,
}

impl StaticConfiguration {
    pub fn new(endpoint: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            endpoint: RwLock::new(Some(endpoint.into())),
            access_token: RwLock::new(Some(access_token.into())),
        }
    }

    /// No endpoint and no token; the connection stays disconnected until set.
    pub fn empty() -> Self {
        Self {
            endpoint: RwLock::new(None),
            access_token: RwLock::new(None),
        }
    }

    pub fn set_endpoint(&self, endpoint: Option<String>) {
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    pub fn set_access_token(&self, token: impl Into<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear_access_token(&self) {
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for StaticConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticConfiguration")
            .field("endpoint", &self.current_endpoint())
            .field(
                "access_token",
                &self
                    .access_token
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[async_trait]
impl ConnectionConfiguration for StaticConfiguration {
    fn current_endpoint(&self) -> Option<String> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn fetch_auth_token(&self) -> Result<String> {
        self.access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| HassLinkError::AuthenticationError("No access token configured".into()))
    }
}
