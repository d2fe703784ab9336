//! HTTP channel for perpetual (`Rest`) requests.
//!
//! Rest requests live outside the socket lifecycle: they are sent once, over
//! HTTP, against the same server the WebSocket endpoint points at.

use crate::{
    error::{ExternalError, HassLinkError, Result},
    models::{HttpMethod, JsonMap},
    timeouts::HassLinkTimeouts,
};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use url::Url;

/// Sends one Rest request and returns its decoded body.
#[async_trait]
pub trait RestChannel: Send + Sync {
    async fn send(
        &self,
        endpoint: &str,
        token: &str,
        method: HttpMethod,
        path: &str,
        body: JsonMap,
    ) -> Result<JsonValue>;
}

/// [`RestChannel`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpRestChannel {
    http_client: reqwest::Client,
}

impl HttpRestChannel {
    pub fn new(timeouts: &HassLinkTimeouts) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !timeouts.rest_timeout.is_zero() {
            builder = builder.timeout(timeouts.rest_timeout);
        }
        if !timeouts.connection_timeout.is_zero() {
            builder = builder.connect_timeout(timeouts.connection_timeout);
        }
        let http_client = builder.build().map_err(|e| {
            HassLinkError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { http_client })
    }

    /// Use an already configured client.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl RestChannel for HttpRestChannel {
    async fn send(
        &self,
        endpoint: &str,
        token: &str,
        method: HttpMethod,
        path: &str,
        body: JsonMap,
    ) -> Result<JsonValue> {
        let url = rest_url(endpoint, path)?;
        log::debug!("[hass-link] {} {}", method.as_str(), url);

        let mut request = match method {
            HttpMethod::Get => self.http_client.get(url),
            HttpMethod::Post => self.http_client.post(url),
            HttpMethod::Put => self.http_client.put(url),
            HttpMethod::Patch => self.http_client.patch(url),
            HttpMethod::Delete => self.http_client.delete(url),
        }
        .bearer_auth(token);

        if method != HttpMethod::Get && !body.is_empty() {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            Ok(decode_body(&text))
        } else {
            let message = match decode_body(&text) {
                JsonValue::Object(map) => map
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| JsonValue::Object(map.clone()).to_string()),
                JsonValue::String(s) if !s.is_empty() => s,
                _ => status.canonical_reason().unwrap_or("Request failed").to_string(),
            };
            Err(ExternalError::new(status.as_u16().to_string(), message).into())
        }
    }
}

/// JSON if the body parses, a string otherwise, `null` when empty.
fn decode_body(text: &str) -> JsonValue {
    if text.trim().is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

/// Map a WebSocket endpoint to the HTTP URL of `/api/<path>` on the same host.
pub(crate) fn rest_url(endpoint: &str, path: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint.trim()).map_err(|e| {
        HassLinkError::ConfigurationError(format!("Invalid endpoint '{}': {}", endpoint, e))
    })?;

    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(HassLinkError::ConfigurationError(format!(
                "Unsupported endpoint scheme '{}'",
                other
            )))
        },
    };
    url.set_scheme(scheme).map_err(|_| {
        HassLinkError::ConfigurationError(format!("Cannot use endpoint '{}' for HTTP", endpoint))
    })?;

    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    url.set_path(&format!("/api/{}", path.trim_start_matches('/')));
    url.set_query(query);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rest_url_from_websocket_endpoint() {
        let url = rest_url("ws://homeassistant.local:8123/api/websocket", "states").unwrap();
        assert_eq!(url.as_str(), "http://homeassistant.local:8123/api/states");

        let url = rest_url("wss://example.com/api/websocket", "/history/period?x=1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/history/period?x=1");
    }

    #[test]
    fn test_rest_url_rejects_bad_endpoints() {
        assert!(matches!(
            rest_url("not a url", "states"),
            Err(HassLinkError::ConfigurationError(_))
        ));
        assert!(matches!(
            rest_url("ftp://example.com", "states"),
            Err(HassLinkError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_decode_body() {
        assert_eq!(decode_body(""), JsonValue::Null);
        assert_eq!(decode_body(r#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(decode_body("plain log text"), json!("plain log text"));
    }
}
