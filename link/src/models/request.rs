use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::time::Duration;

/// JSON object payload of a request.
pub type JsonMap = Map<String, JsonValue>;

/// Identifier assigned to a request when it is sent.
///
/// Identifiers strictly increase for the lifetime of a connection and are never
/// reused, not even across reconnects, so a late reply for a cancelled or
/// reissued request can never be mistaken for the reply to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestIdentifier(u64);

impl RequestIdentifier {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestIdentifier {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// HTTP verb of a Rest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request travels to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestType {
    /// A command frame on the WebSocket, e.g. `get_states`.
    WebSocket(String),
    /// A one-shot HTTP request against `/api/<path>`.
    Rest { method: HttpMethod, path: String },
    /// A binary frame addressed to a server-side stream handler.
    BinaryStream(u8),
}

impl RequestType {
    pub fn rest(method: HttpMethod, path: impl Into<String>) -> Self {
        Self::Rest {
            method,
            path: path.into(),
        }
    }

    /// The command (WebSocket) or path (Rest) this request addresses.
    pub fn command(&self) -> String {
        match self {
            RequestType::WebSocket(command) => command.clone(),
            RequestType::Rest { path, .. } => path.clone(),
            RequestType::BinaryStream(handler_id) => format!("binary_stream:{}", handler_id),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            RequestType::WebSocket(_) => RequestKind::WebSocket,
            RequestType::Rest { .. } => RequestKind::Rest,
            RequestType::BinaryStream(_) => RequestKind::BinaryStream,
        }
    }

    /// Perpetual requests are sent once, independent of the socket lifecycle.
    pub fn is_perpetual(&self) -> bool {
        matches!(self, RequestType::Rest { .. })
    }
}

impl From<&str> for RequestType {
    fn from(command: &str) -> Self {
        Self::WebSocket(command.to_string())
    }
}

impl From<String> for RequestType {
    fn from(command: String) -> Self {
        Self::WebSocket(command)
    }
}

/// Coarse classification of [`RequestType`], used to decide what may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    WebSocket,
    Rest,
    BinaryStream,
}

/// The set of request kinds that may currently be transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedKinds {
    web_socket: bool,
    rest: bool,
    binary_stream: bool,
}

impl AllowedKinds {
    pub const ALL: Self = Self {
        web_socket: true,
        rest: true,
        binary_stream: true,
    };

    pub const REST_ONLY: Self = Self {
        web_socket: false,
        rest: true,
        binary_stream: false,
    };

    pub const NONE: Self = Self {
        web_socket: false,
        rest: false,
        binary_stream: false,
    };

    pub fn contains(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::WebSocket => self.web_socket,
            RequestKind::Rest => self.rest,
            RequestKind::BinaryStream => self.binary_stream,
        }
    }
}

/// A request to the server. Immutable once handed to a connection.
///
/// # Example
///
/// ```rust
/// use hass_link::Request;
/// use std::time::Duration;
///
/// let request = Request::new("call_service")
///     .with_field("domain", "light")
///     .with_field("service", "turn_on")
///     .with_retry_timeout(Duration::from_secs(30));
/// assert!(request.should_retry);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestType,
    pub data: JsonMap,
    /// Whether the request is replayed after a reconnect.
    pub should_retry: bool,
    /// How long after creation a replay is still worthwhile.
    pub retry_timeout: Option<Duration>,
}

impl Request {
    /// Create a retrying request with an empty payload.
    pub fn new(kind: impl Into<RequestType>) -> Self {
        Self {
            kind: kind.into(),
            data: JsonMap::new(),
            should_retry: true,
            retry_timeout: None,
        }
    }

    /// Replace the payload.
    pub fn with_data(mut self, data: JsonMap) -> Self {
        self.data = data;
        self
    }

    /// Set a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_should_retry(mut self, should_retry: bool) -> Self {
        self.should_retry = should_retry;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    /// `subscribe_events`, optionally filtered to a single event type.
    pub fn subscribe_events(event_type: Option<&str>) -> Self {
        let request = Self::new("subscribe_events");
        match event_type {
            Some(event_type) => request.with_field("event_type", event_type),
            None => request,
        }
    }

    /// The cancel request for a server-side subscription.
    pub fn unsubscribe(subscription: RequestIdentifier) -> Self {
        Self::new("unsubscribe_events")
            .with_field("subscription", subscription.get())
            .with_should_retry(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request = Request::new("get_states");
        assert_eq!(request.kind, RequestType::WebSocket("get_states".to_string()));
        assert!(request.data.is_empty());
        assert!(request.should_retry);
        assert!(request.retry_timeout.is_none());
    }

    #[test]
    fn test_unsubscribe_request_shape() {
        let request = Request::unsubscribe(RequestIdentifier::new(42));
        assert_eq!(request.kind.command(), "unsubscribe_events");
        assert_eq!(request.data.get("subscription"), Some(&json!(42)));
        assert!(!request.should_retry);
    }

    #[test]
    fn test_only_rest_is_perpetual() {
        assert!(RequestType::rest(HttpMethod::Get, "config").is_perpetual());
        assert!(!RequestType::from("ping").is_perpetual());
        assert!(!RequestType::BinaryStream(1).is_perpetual());
    }

    #[test]
    fn test_allowed_kinds() {
        assert!(AllowedKinds::ALL.contains(RequestKind::BinaryStream));
        assert!(AllowedKinds::REST_ONLY.contains(RequestKind::Rest));
        assert!(!AllowedKinds::REST_ONLY.contains(RequestKind::WebSocket));
        assert!(!AllowedKinds::NONE.contains(RequestKind::Rest));
    }

    #[test]
    fn test_identifier_serializes_as_integer() {
        let id = RequestIdentifier::new(7);
        assert_eq!(serde_json::to_value(id).unwrap(), json!(7));
        assert_eq!(id.to_string(), "7");
    }
}
