//! Timeout configuration for hass-link transports.
//!
//! Covers the WebSocket transport (connect, send, keepalive) and the Rest
//! channel used for perpetual requests.

use std::time::Duration;

/// Timeout configuration for hass-link transports.
///
/// # Examples
///
/// ```rust
/// use hass_link::HassLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = HassLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = HassLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(60))
///     .rest_timeout(Duration::from_secs(120))
///     .build();
///
/// // Aggressive timeouts for a server on the local network
/// let timeouts = HassLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct HassLinkTimeouts {
    /// Timeout for establishing the WebSocket (TCP + TLS + upgrade).
    /// Default: 10 seconds
    pub connection_timeout: Duration,

    /// Timeout for writing a single frame to the socket.
    /// Default: 10 seconds
    pub send_timeout: Duration,

    /// Timeout for a complete Rest request/response exchange.
    /// Default: 30 seconds
    pub rest_timeout: Duration,

    /// Keep-alive ping interval for the WebSocket.
    /// Set to 0 to disable keep-alive pings.
    /// Default: 20 seconds
    pub keepalive_interval: Duration,

    /// Maximum time to wait for a Pong (or any other frame) after a keepalive
    /// Ping before the socket is considered dead.
    /// Set to 0 to disable pong timeout checking.
    /// Default: 10 seconds
    pub pong_timeout: Duration,
}

impl Default for HassLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(10),
            rest_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl HassLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> HassLinkTimeoutsBuilder {
        HassLinkTimeoutsBuilder::new()
    }

    /// Shorter timeouts suitable for a server on the local network.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(3),
            rest_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }

    /// Longer timeouts for remote or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(30),
            rest_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(45),
            pong_timeout: Duration::from_secs(20),
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for creating custom [`HassLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct HassLinkTimeoutsBuilder {
    timeouts: HassLinkTimeouts,
}

impl HassLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: HassLinkTimeouts::default(),
        }
    }

    /// Set the WebSocket connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the per-frame send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send_timeout = timeout;
        self
    }

    /// Set the Rest request timeout.
    pub fn rest_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.rest_timeout = timeout;
        self
    }

    /// Set the Rest request timeout in seconds.
    pub fn rest_timeout_secs(self, secs: u64) -> Self {
        self.rest_timeout(Duration::from_secs(secs))
    }

    /// Set the keepalive ping interval.
    /// Set to 0 to disable keepalive pings.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Set the pong timeout (max wait for Pong after sending a Ping).
    /// Set to 0 to disable pong timeout checking.
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong_timeout = timeout;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> HassLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = HassLinkTimeouts::default();
        assert_eq!(timeouts.connection_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.rest_timeout, Duration::from_secs(30));
        assert_eq!(timeouts.keepalive_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_builder() {
        let timeouts = HassLinkTimeouts::builder()
            .connection_timeout_secs(60)
            .rest_timeout_secs(120)
            .keepalive_interval(Duration::ZERO)
            .build();

        assert_eq!(timeouts.connection_timeout, Duration::from_secs(60));
        assert_eq!(timeouts.rest_timeout, Duration::from_secs(120));
        assert!(timeouts.keepalive_interval.is_zero());
    }

    #[test]
    fn test_presets_are_ordered() {
        let fast = HassLinkTimeouts::fast();
        let relaxed = HassLinkTimeouts::relaxed();
        assert!(fast.connection_timeout < relaxed.connection_timeout);
        assert!(fast.rest_timeout < relaxed.rest_timeout);
    }

    #[test]
    fn test_is_no_timeout() {
        assert!(HassLinkTimeouts::is_no_timeout(Duration::ZERO));
        assert!(!HassLinkTimeouts::is_no_timeout(Duration::from_secs(1)));
        assert!(HassLinkTimeouts::is_no_timeout(Duration::from_secs(86400 * 400)));
    }
}
