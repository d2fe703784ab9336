use serde::{Deserialize, Serialize};

/// Connection-level options.
///
/// These options control:
/// - Automatic reconnection after the socket drops
/// - The reconnect delay and its tolerance window
/// - Which server events prompt a retry of failed subscriptions
///
/// Transport timeouts live in [`HassLinkTimeouts`](crate::HassLinkTimeouts).
///
/// # Example
///
/// ```rust
/// use hass_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_reconnect_delay_ms(2000)
///     .with_retry_subscription_events(vec!["component_loaded".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Reconnect automatically when the socket drops.
    /// Default: true
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Delay before a reconnect attempt, in milliseconds.
    /// Default: 5000ms
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Extra time a reconnect attempt may slip past its delay, in milliseconds.
    /// The scheduler spreads attempts within this window.
    /// Default: 1000ms
    #[serde(default = "default_reconnect_tolerance_ms")]
    pub reconnect_tolerance_ms: u64,

    /// Coalescing window for retrying failed subscriptions, in milliseconds.
    /// Default: 1000ms
    #[serde(default = "default_retry_subscriptions_delay_ms")]
    pub retry_subscriptions_delay_ms: u64,

    /// Server event types that prompt a retry of failed subscriptions, e.g. a
    /// newly loaded integration making a previously unknown command available.
    /// Default: `component_loaded`, `core_config_updated`
    #[serde(default = "default_retry_subscription_events")]
    pub retry_subscription_events: Vec<String>,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_reconnect_tolerance_ms() -> u64 {
    1000
}

fn default_retry_subscriptions_delay_ms() -> u64 {
    1000
}

fn default_retry_subscription_events() -> Vec<String> {
    vec!["component_loaded".to_string(), "core_config_updated".to_string()]
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_tolerance_ms: default_reconnect_tolerance_ms(),
            retry_subscriptions_delay_ms: default_retry_subscriptions_delay_ms(),
            retry_subscription_events: default_retry_subscription_events(),
        }
    }
}

impl ConnectionOptions {
    /// Create new connection options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the delay before a reconnect attempt (in milliseconds)
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the reconnect tolerance window (in milliseconds)
    pub fn with_reconnect_tolerance_ms(mut self, tolerance_ms: u64) -> Self {
        self.reconnect_tolerance_ms = tolerance_ms;
        self
    }

    /// Set the coalescing window for subscription retries (in milliseconds)
    pub fn with_retry_subscriptions_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_subscriptions_delay_ms = delay_ms;
        self
    }

    /// Set the event types that trigger a retry of failed subscriptions.
    /// An empty list disables the internal trigger subscriptions.
    pub fn with_retry_subscription_events(mut self, events: Vec<String>) -> Self {
        self.retry_subscription_events = events;
        self
    }
}
