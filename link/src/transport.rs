//! WebSocket transport abstraction.
//!
//! The connection engine never touches a socket directly. It asks a
//! [`TransportFactory`] for a [`Transport`] bound to an endpoint and receives
//! [`TransportEvent`]s through a sink. [`WebSocketTransport`] is the default
//! implementation on top of tokio-tungstenite; tests substitute an in-memory
//! transport.
//!
//! The default transport runs one background task per session that owns the
//! socket and handles:
//!
//! - Frame writes requested through the public handle
//! - Keepalive pings with jitter, and a pong deadline
//! - Close frames, stream errors and end-of-stream

use crate::{
    error::{HassLinkError, Result},
    timeouts::HassLinkTimeouts,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// Close code sent when the client disconnects on purpose.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code sent when the client goes away to reconnect elsewhere.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Maximum text frame size accepted from the server (64 MiB).
const MAX_TEXT_MESSAGE_BYTES: usize = 64 << 20;

/// A duration far enough in the future (~100 years) to act as "never" for
/// deadline calculations without overflowing `Instant::now() + dur`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Events reported by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket is open.
    Connected,
    /// A text frame arrived.
    Text(String),
    /// The server closed the socket with a close frame.
    Disconnected { code: Option<u16>, reason: String },
    /// The stream ended without a close frame.
    PeerClosed,
    /// The client cancelled the session.
    Cancelled,
    /// The connection attempt or the socket failed.
    Error(HassLinkError),
}

impl TransportEvent {
    /// The error carried into `Disconnected` for this event, if any.
    pub fn disconnect_error(&self) -> Option<HassLinkError> {
        match self {
            TransportEvent::Error(error) => Some(error.clone()),
            TransportEvent::Disconnected { code, reason } => {
                Some(HassLinkError::WebSocketError(match code {
                    Some(code) => format!("Server closed connection: {} (code: {})", reason, code),
                    None => format!("Server closed connection: {}", reason),
                }))
            },
            TransportEvent::PeerClosed => Some(HassLinkError::WebSocketError(
                "WebSocket stream ended".to_string(),
            )),
            TransportEvent::Connected | TransportEvent::Text(_) | TransportEvent::Cancelled => None,
        }
    }
}

/// Receives transport events. Called from the transport's own task.
pub type TransportEventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Invoked once a frame was written (or failed to be).
pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// A single WebSocket session.
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Open the socket. Calling it on an open or opening transport is a no-op.
    fn connect(&self);

    /// Close the socket with `code`. Reports [`TransportEvent::Cancelled`].
    fn disconnect(&self, code: u16);

    fn write_text(&self, text: String, done: WriteCompletion);

    fn write_binary(&self, data: Bytes, done: WriteCompletion);
}

/// Creates transports for an endpoint.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &str, events: TransportEventSink) -> Arc<dyn Transport>;
}

// ── Default transport ───────────────────────────────────────────────────────

type WebSocketStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

enum TransportCmd {
    Write {
        message: Message,
        done: WriteCompletion,
    },
    Close {
        code: u16,
    },
}

struct Session {
    cmd_tx: mpsc::UnboundedSender<TransportCmd>,
    task: JoinHandle<()>,
}

/// Factory for [`WebSocketTransport`].
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransportFactory {
    timeouts: HassLinkTimeouts,
}

impl WebSocketTransportFactory {
    pub fn new(timeouts: HassLinkTimeouts) -> Self {
        Self { timeouts }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, endpoint: &str, events: TransportEventSink) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(
            endpoint.to_string(),
            self.timeouts.clone(),
            events,
        ))
    }
}

/// tokio-tungstenite backed [`Transport`].
pub struct WebSocketTransport {
    endpoint: String,
    timeouts: HassLinkTimeouts,
    events: TransportEventSink,
    session: Mutex<Option<Session>>,
}

impl WebSocketTransport {
    pub fn new(endpoint: String, timeouts: HassLinkTimeouts, events: TransportEventSink) -> Self {
        Self {
            endpoint,
            timeouts,
            events,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, message: Message, done: WriteCompletion) {
        let rejected = {
            let session = self.session();
            match session.as_ref() {
                Some(session) => match session.cmd_tx.send(TransportCmd::Write { message, done }) {
                    Ok(()) => None,
                    Err(mpsc::error::SendError(TransportCmd::Write { done, .. })) => Some(done),
                    Err(_) => None,
                },
                None => Some(done),
            }
        };
        if let Some(done) = rejected {
            done(Err(HassLinkError::WebSocketError(
                "WebSocket is not connected".to_string(),
            )));
        }
    }
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("endpoint", &self.endpoint)
            .field("open", &self.session().is_some())
            .finish()
    }
}

impl Transport for WebSocketTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) {
        let mut session = self.session();
        if let Some(existing) = session.as_ref() {
            if !existing.task.is_finished() {
                return;
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session_task(
            self.endpoint.clone(),
            self.timeouts.clone(),
            self.events.clone(),
            cmd_rx,
        ));
        *session = Some(Session { cmd_tx, task });
    }

    fn disconnect(&self, code: u16) {
        if let Some(session) = self.session().take() {
            // The task reports Cancelled once it has sent the close frame.
            if session.cmd_tx.send(TransportCmd::Close { code }).is_err() {
                session.task.abort();
            }
        }
    }

    fn write_text(&self, text: String, done: WriteCompletion) {
        self.enqueue(Message::Text(text.into()), done);
    }

    fn write_binary(&self, data: Bytes, done: WriteCompletion) {
        self.enqueue(Message::Binary(data), done);
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session().take() {
            session.task.abort();
        }
    }
}

async fn session_task(
    endpoint: String,
    timeouts: HassLinkTimeouts,
    events: TransportEventSink,
    mut cmd_rx: mpsc::UnboundedReceiver<TransportCmd>,
) {
    let mut ws = match establish(&endpoint, &timeouts, &mut cmd_rx).await {
        Establish::Open(ws) => *ws,
        Establish::Cancelled => {
            events(TransportEvent::Cancelled);
            return;
        },
        Establish::Failed(error) => {
            events(TransportEvent::Error(error));
            return;
        },
    };

    log::info!("[hass-link] WebSocket connected to {}", endpoint);
    events(TransportEvent::Connected);

    let has_keepalive = !timeouts.keepalive_interval.is_zero();
    let keepalive_dur = if has_keepalive {
        jitter_keepalive_interval(timeouts.keepalive_interval, &endpoint)
    } else {
        FAR_FUTURE
    };
    let mut idle_deadline = TokioInstant::now() + keepalive_dur;

    let pong_timeout_dur = timeouts.pong_timeout;
    let has_pong_timeout = has_keepalive && !pong_timeout_dur.is_zero();
    let mut awaiting_pong = false;
    let mut pong_deadline = TokioInstant::now() + FAR_FUTURE;

    loop {
        let idle_sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(idle_sleep);

        let pong_sleep = tokio::time::sleep_until(pong_deadline);
        tokio::pin!(pong_sleep);

        tokio::select! {
            biased;

            _ = &mut pong_sleep, if has_pong_timeout && awaiting_pong => {
                log::warn!(
                    "[hass-link] Pong timeout ({:?}), server unresponsive",
                    pong_timeout_dur,
                );
                events(TransportEvent::Error(HassLinkError::TimeoutError(format!(
                    "Pong timeout ({:?})",
                    pong_timeout_dur
                ))));
                return;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCmd::Write { message, done }) => {
                        let sent = tokio::time::timeout(timeouts.send_timeout, ws.send(message));
                        let result = match sent.await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(HassLinkError::from(e)),
                            Err(_) => Err(HassLinkError::TimeoutError(format!(
                                "Send timeout ({:?})",
                                timeouts.send_timeout
                            ))),
                        };
                        let failed = result.as_ref().err().cloned();
                        done(result);
                        if let Some(error) = failed {
                            log::warn!("[hass-link] WebSocket write failed: {}", error);
                            events(TransportEvent::Error(error));
                            return;
                        }
                    },
                    Some(TransportCmd::Close { code }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = ws.close(Some(frame)).await;
                        events(TransportEvent::Cancelled);
                        return;
                    },
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    },
                }
            }

            _ = &mut idle_sleep, if has_keepalive && !awaiting_pong => {
                if let Err(e) = ws.send(Message::Ping(Bytes::new())).await {
                    log::warn!("[hass-link] Keepalive ping failed: {}", e);
                    events(TransportEvent::Error(HassLinkError::from(e)));
                    return;
                }
                if has_pong_timeout {
                    awaiting_pong = true;
                    pong_deadline = TokioInstant::now() + pong_timeout_dur;
                }
                idle_deadline = TokioInstant::now() + keepalive_dur;
            }

            frame = ws.next() => {
                idle_deadline = TokioInstant::now() + keepalive_dur;
                if awaiting_pong {
                    awaiting_pong = false;
                    pong_deadline = TokioInstant::now() + FAR_FUTURE;
                }

                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_TEXT_MESSAGE_BYTES {
                            log::warn!("[hass-link] Text message too large ({} bytes)", text.len());
                            continue;
                        }
                        events(TransportEvent::Text(text.as_str().to_string()));
                    },
                    Some(Ok(Message::Binary(data))) => {
                        log::debug!("[hass-link] Ignoring binary frame ({} bytes)", data.len());
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let event = match frame {
                            Some(f) => TransportEvent::Disconnected {
                                code: Some(f.code.into()),
                                reason: f.reason.to_string(),
                            },
                            None => TransportEvent::Disconnected {
                                code: None,
                                reason: "Server closed connection".to_string(),
                            },
                        };
                        events(event);
                        return;
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    },
                    Some(Ok(Message::Pong(_))) => {
                        log::debug!("[hass-link] Keepalive: received Pong");
                    },
                    Some(Ok(Message::Frame(_))) => {},
                    Some(Err(e)) => {
                        events(TransportEvent::Error(HassLinkError::from(e)));
                        return;
                    },
                    None => {
                        events(TransportEvent::PeerClosed);
                        return;
                    },
                }
            }
        }
    }
}

enum Establish {
    Open(Box<WebSocketStream>),
    Cancelled,
    Failed(HassLinkError),
}

/// Open the socket, honouring a close request that arrives mid-handshake.
async fn establish(
    endpoint: &str,
    timeouts: &HassLinkTimeouts,
    cmd_rx: &mut mpsc::UnboundedReceiver<TransportCmd>,
) -> Establish {
    let connect = tokio::time::timeout(
        timeouts.connection_timeout,
        tokio_tungstenite::connect_async(endpoint),
    );
    tokio::pin!(connect);

    loop {
        tokio::select! {
            result = &mut connect => {
                return match result {
                    Ok(Ok((stream, _response))) => Establish::Open(Box::new(stream)),
                    Ok(Err(e)) => {
                        log::warn!("[hass-link] Connection to {} failed: {}", endpoint, e);
                        Establish::Failed(HassLinkError::WebSocketError(format!(
                            "Connection failed: {}",
                            e
                        )))
                    },
                    Err(_) => Establish::Failed(HassLinkError::TimeoutError(format!(
                        "Connection timeout ({:?})",
                        timeouts.connection_timeout
                    ))),
                };
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TransportCmd::Write { done, .. }) => {
                        done(Err(HassLinkError::WebSocketError(
                            "WebSocket is not connected".to_string(),
                        )));
                    },
                    Some(TransportCmd::Close { .. }) | None => return Establish::Cancelled,
                }
            }
        }
    }
}

/// Spread keepalive pings of different endpoints by +/-20%.
fn jitter_keepalive_interval(base: Duration, endpoint: &str) -> Duration {
    let base_ms = base.as_millis() as u64;
    if base_ms <= 1 {
        return base;
    }

    let jitter_span = (base_ms / 5).max(1);
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    let hashed = hasher.finish();

    let offset = (hashed % (2 * jitter_span + 1)) as i64 - jitter_span as i64;
    let jittered_ms = if offset >= 0 {
        base_ms.saturating_add(offset as u64)
    } else {
        base_ms.saturating_sub((-offset) as u64).max(1)
    };

    Duration::from_millis(jittered_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_jitter_stays_within_window() {
        let base = Duration::from_secs(20);
        for endpoint in ["ws://a/api/websocket", "ws://b/api/websocket", "wss://c"] {
            let jittered = jitter_keepalive_interval(base, endpoint);
            assert!(jittered >= Duration::from_secs(16));
            assert!(jittered <= Duration::from_secs(24));
            assert_eq!(jittered, jitter_keepalive_interval(base, endpoint));
        }
        assert_eq!(
            jitter_keepalive_interval(Duration::from_millis(1), "x"),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn test_disconnect_error_mapping() {
        assert!(TransportEvent::Connected.disconnect_error().is_none());
        assert!(TransportEvent::Cancelled.disconnect_error().is_none());

        let closed = TransportEvent::Disconnected {
            code: Some(1001),
            reason: "restarting".to_string(),
        };
        assert_eq!(
            closed.disconnect_error().map(|e| e.to_string()),
            Some("WebSocket error: Server closed connection: restarting (code: 1001)".to_string())
        );
        assert!(matches!(
            TransportEvent::PeerClosed.disconnect_error(),
            Some(HassLinkError::WebSocketError(_))
        ));
    }

    #[tokio::test]
    async fn test_write_without_session_fails() {
        let transport = WebSocketTransport::new(
            "ws://127.0.0.1:1/api/websocket".to_string(),
            HassLinkTimeouts::default(),
            Arc::new(|_| {}),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        transport.write_text(
            "{}".to_string(),
            Box::new(move |result| {
                let _ = tx.send(result.is_err());
            }),
        );
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = WebSocketTransport::new(
            "ws://127.0.0.1:1/api/websocket".to_string(),
            HassLinkTimeouts::fast(),
            Arc::new(move |event| {
                let _ = tx.send(event);
            }),
        );
        transport.connect();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Error(_)), "got {:?}", event);
    }
}
