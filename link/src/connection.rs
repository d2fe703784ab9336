//! The connection orchestrator.
//!
//! A [`Connection`] owns the transport, drives the authentication handshake,
//! feeds the multiplexer and reconnects after the socket drops:
//!
//! - `connect()` opens a transport for the configured endpoint (a prior
//!   transport for a different endpoint is closed and replaced)
//! - entering `Authenticating` fetches a token and sends the `auth` frame
//! - entering `Command` sends everything that was waiting
//! - entering `Disconnected` forgets the socket and, unless the disconnect was
//!   requested, schedules a reconnect
//!
//! Every externally observed callback runs on the connection's callback queue.

mod builder;
mod requests;
mod responses;

pub use builder::ConnectionBuilder;
pub use responses::{is_auth_invalid, AUTH_INVALID_CODE};

use crate::{
    cancellable::Cancellable,
    configuration::ConnectionConfiguration,
    dispatch::DispatchQueue,
    error::{HassLinkError, Result},
    event_handlers::{ConnectionError, EventHandlers},
    models::{ConnectionOptions, Request},
    multiplexer::{Completion, EventHandler, InitiatedHandler, Invocation, Multiplexer},
    protected::Protected,
    reconnect::{ReconnectScheduler, ReconnectState},
    response::{ConnectionPhase, ResponseController},
    rest::RestChannel,
    transport::{
        Transport, TransportEvent, TransportEventSink, TransportFactory, CLOSE_GOING_AWAY,
        CLOSE_NORMAL,
    },
};
use serde_json::Value as JsonValue;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::oneshot;

/// Observable connection state, derived from the phase and the reconnect
/// scheduler.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// A transport is opening.
    Connecting,
    /// The socket is open and the access token is being verified.
    Authenticating,
    /// Authenticated; requests flow.
    Ready { version: String },
    /// Not connected. `reason` says whether (and when) a reconnect happens.
    Disconnected { reason: ReconnectState },
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready { .. })
    }
}

/// Observes phase changes. Returning `false` unregisters the observer.
pub type PhaseObserver = Arc<dyn Fn(&ConnectionPhase) -> bool + Send + Sync>;

/// A persistent, auto-reconnecting connection.
///
/// Cheap to clone; all clones share the same socket and request state.
///
/// # Examples
///
/// ```rust,no_run
/// use hass_link::{Connection, Request, StaticConfiguration};
/// use std::sync::Arc;
///
/// # async fn example() -> hass_link::Result<()> {
/// let connection = Connection::builder(Arc::new(StaticConfiguration::new(
///     "ws://homeassistant.local:8123/api/websocket",
///     "long-lived-token",
/// )))
/// .build()?;
///
/// connection.connect();
/// let states = connection.send_async(Request::new("get_states")).await?;
/// println!("{}", states);
///
/// let token = connection.subscribe(Request::subscribe_events(Some("state_changed")), |_, event| {
///     println!("event: {}", event);
/// });
/// // ... later
/// token.cancel();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning handle to a [`Connection`].
#[derive(Clone, Default)]
pub struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    /// A handle that never upgrades.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

pub(crate) struct ConnectionInner {
    configuration: Arc<dyn ConnectionConfiguration>,
    options: ConnectionOptions,
    transport_factory: Arc<dyn TransportFactory>,
    rest_channel: Arc<dyn RestChannel>,
    handlers: EventHandlers,
    work_queue: DispatchQueue,
    callback_queue: DispatchQueue,
    response: Arc<ResponseController>,
    multiplexer: Arc<Multiplexer>,
    reconnect: Arc<ReconnectScheduler>,
    link: Protected<TransportLink>,
    observers: Protected<ObserverList>,
    auth_attempt: AtomicU64,
    retry_triggers: Mutex<Vec<Cancellable>>,
    weak_self: Weak<ConnectionInner>,
}

#[derive(Default)]
struct TransportLink {
    transport: Option<Arc<dyn Transport>>,
    /// Bumped whenever the transport is replaced; events tagged with an older
    /// generation are ignored.
    generation: u64,
    connecting: bool,
    disconnect_requested: bool,
}

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    observers: Vec<(u64, PhaseObserver)>,
}

impl Connection {
    /// Create a new builder for configuring the connection.
    pub fn builder(configuration: Arc<dyn ConnectionConfiguration>) -> ConnectionBuilder {
        ConnectionBuilder::new(configuration)
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.response.phase()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.inner.reconnect.reason()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Queue on which every callback of this connection runs.
    pub fn callback_queue(&self) -> &DispatchQueue {
        &self.inner.callback_queue
    }

    /// Queue used for parsing and cache transforms.
    pub fn work_queue(&self) -> &DispatchQueue {
        &self.inner.work_queue
    }

    /// Connect to the configured endpoint. A no-op while already connected
    /// to it.
    pub fn connect(&self) {
        self.inner.connect_transport(true);
    }

    /// Close the socket and stop reconnecting until [`connect`](Self::connect)
    /// is called again. Retryable requests stay queued.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Hint that the network became reachable; a pending reconnect fires now.
    pub fn network_reachable(&self) {
        self.inner.reconnect.network_reachable();
    }

    /// Send a one-shot request. `completion` is invoked at most once, on the
    /// callback queue, unless the returned token is cancelled first.
    pub fn send(
        &self,
        request: Request,
        completion: impl FnOnce(Result<JsonValue>) + Send + 'static,
    ) -> Cancellable {
        self.inner.send(request, Box::new(completion))
    }

    /// Send a one-shot request and wait for its result.
    pub async fn send_async(&self, request: Request) -> Result<JsonValue> {
        let (tx, rx) = oneshot::channel();
        let _token = self.send(request, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| HassLinkError::Cancelled)?
    }

    /// Open a subscription. `handler` receives every event together with a
    /// token that ends the subscription.
    pub fn subscribe(
        &self,
        request: Request,
        handler: impl Fn(Cancellable, JsonValue) + Send + Sync + 'static,
    ) -> Cancellable {
        self.inner.subscribe(request, None, Arc::new(handler))
    }

    /// Like [`subscribe`](Self::subscribe), also reporting the result of the
    /// request that opened the subscription (again after each resubscribe).
    pub fn subscribe_with_initiated(
        &self,
        request: Request,
        initiated: impl Fn(Result<JsonValue>) + Send + Sync + 'static,
        handler: impl Fn(Cancellable, JsonValue) + Send + Sync + 'static,
    ) -> Cancellable {
        self.inner
            .subscribe(request, Some(Arc::new(initiated)), Arc::new(handler))
    }

    /// Observe phase changes on the callback queue until `observer` returns `false`.
    pub fn observe_phase(
        &self,
        observer: impl Fn(&ConnectionPhase) -> bool + Send + Sync + 'static,
    ) {
        let observer: PhaseObserver = Arc::new(observer);
        self.inner.observers.mutate(|list| {
            list.next_id += 1;
            let id = list.next_id;
            list.observers.push((id, observer));
        });
    }

    /// Wait until every job queued on the work and callback queues has run.
    pub async fn flush(&self) {
        for _ in 0..2 {
            self.inner.work_queue.flush().await;
            self.inner.callback_queue.flush().await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("phase", &self.phase())
            .field("tracked", &self.inner.multiplexer.tracked_count())
            .finish()
    }
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        match self.response.phase() {
            ConnectionPhase::Command { version } => ConnectionState::Ready { version },
            ConnectionPhase::Authenticating => ConnectionState::Authenticating,
            ConnectionPhase::Disconnected { .. } => {
                if self.link.read(|link| link.connecting) {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected {
                        reason: self.reconnect.reason(),
                    }
                }
            },
        }
    }

    fn notify_state(&self) {
        if self.handlers.on_state_change.is_some() {
            self.handlers.emit_state_change(self.state());
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.link.read(|link| link.transport.clone())
    }

    fn connect_transport(&self, initial: bool) {
        let Some(endpoint) = self.configuration.current_endpoint() else {
            log::warn!("[hass-link] No endpoint configured, staying disconnected");
            return;
        };

        let live = !self.response.phase().is_disconnected();
        let weak_self = self.weak_self.clone();
        let factory = self.transport_factory.clone();
        let (previous, transport) = self
            .link
            .mutate(|link| {
                link.disconnect_requested = false;
                if let Some(existing) = &link.transport {
                    if existing.endpoint() == endpoint {
                        if live {
                            return (None, None);
                        }
                        link.connecting = true;
                        return (None, Some(existing.clone()));
                    }
                }
                link.connecting = true;

                link.generation += 1;
                let generation = link.generation;
                let sink: TransportEventSink = Arc::new(move |event| {
                    if let Some(inner) = weak_self.upgrade() {
                        inner.did_receive_transport_event(generation, event);
                    }
                });
                let transport = factory.create(&endpoint, sink);
                (link.transport.replace(transport.clone()), Some(transport))
            })
            .into_inner();

        let Some(transport) = transport else {
            log::debug!("[hass-link] Already connected to {}", endpoint);
            return;
        };

        if let Some(previous) = previous {
            log::info!(
                "[hass-link] Endpoint changed from {} to {}",
                previous.endpoint(),
                endpoint
            );
            previous.disconnect(CLOSE_GOING_AWAY);
            self.response.reset();
        }
        if initial {
            self.reconnect.did_start_initial_connect();
        }

        let weak_self = self.weak_self.clone();
        self.callback_queue.dispatch(move || {
            if let Some(inner) = weak_self.upgrade() {
                inner.notify_state();
            }
        });

        log::debug!("[hass-link] Connecting to {}", endpoint);
        transport.connect();
    }

    fn disconnect(&self) {
        let previous = self
            .link
            .mutate(|link| {
                link.disconnect_requested = true;
                link.connecting = false;
                link.generation += 1;
                link.transport.take()
            })
            .into_inner();

        self.reconnect.did_disconnect_permanently();
        if let Some(transport) = previous {
            log::info!("[hass-link] Disconnecting from {}", transport.endpoint());
            transport.disconnect(CLOSE_NORMAL);
        }
        self.response.reset();
    }

    /// Drop the socket and let the reconnect scheduler take over.
    fn disconnect_temporarily(&self, error: HassLinkError) {
        let previous = self
            .link
            .mutate(|link| {
                link.generation += 1;
                link.transport.take()
            })
            .into_inner();

        if let Some(transport) = previous {
            transport.disconnect(CLOSE_NORMAL);
        }
        self.response.did_disconnect(error);
    }

    fn did_receive_transport_event(&self, generation: u64, event: TransportEvent) {
        let current = self
            .link
            .read(|link| link.generation == generation && link.transport.is_some());
        if !current {
            log::debug!("[hass-link] Ignoring event from a replaced transport: {:?}", event);
            return;
        }

        if let TransportEvent::Error(error) = &event {
            let handlers = self.handlers.clone();
            let message = error.to_string();
            self.callback_queue.dispatch(move || {
                handlers.emit_error(ConnectionError::new(message, true));
            });
        }
        self.response.did_receive_event(event);
    }

    /// Called by the reconnect scheduler on the callback queue.
    fn reconnect_now(&self) {
        if self.link.read(|link| link.disconnect_requested) {
            return;
        }
        log::info!(
            "[hass-link] Reconnecting (attempt {})",
            self.reconnect.retry_count()
        );
        self.connect_transport(false);
    }

    fn send(&self, request: Request, completion: Completion) -> Cancellable {
        let invocation = Invocation::single(request, self.multiplexer.clock().now(), completion);
        self.multiplexer.add(invocation.clone());
        self.cancellable_for(invocation)
    }

    fn subscribe(
        &self,
        request: Request,
        initiated: Option<InitiatedHandler>,
        handler: EventHandler,
    ) -> Cancellable {
        let invocation = Invocation::subscription(
            request,
            self.multiplexer.clock().now(),
            initiated,
            handler,
        );
        self.multiplexer.add(invocation.clone());
        self.cancellable_for(invocation)
    }

    fn cancellable_for(&self, invocation: Arc<Invocation>) -> Cancellable {
        let multiplexer = Arc::downgrade(&self.multiplexer);
        Cancellable::new(move || {
            if let Some(multiplexer) = multiplexer.upgrade() {
                multiplexer.cancel(&invocation);
            }
        })
    }

    /// Subscribe to the server events that make failed subscriptions worth retrying.
    fn install_retry_triggers(&self) {
        let mut tokens = Vec::new();
        for event_type in &self.options.retry_subscription_events {
            let multiplexer = Arc::downgrade(&self.multiplexer);
            let event_name = event_type.clone();
            let handler: EventHandler = Arc::new(move |_, _| {
                log::debug!(
                    "[hass-link] '{}' received, retrying failed subscriptions",
                    event_name
                );
                if let Some(multiplexer) = multiplexer.upgrade() {
                    multiplexer.retry_subscriptions();
                }
            });
            tokens.push(self.subscribe(
                Request::subscribe_events(Some(event_type.as_str())),
                None,
                handler,
            ));
        }
        *self
            .retry_triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tokens;
    }

    fn notify_phase_observers(&self, phase: &ConnectionPhase) {
        let observers = self.observers.read(|list| list.observers.clone());
        if observers.is_empty() {
            return;
        }

        let finished: Vec<u64> = observers
            .into_iter()
            .filter_map(|(id, observer)| (!observer(phase)).then_some(id))
            .collect();
        if !finished.is_empty() {
            self.observers.mutate(|list| {
                list.observers.retain(|(id, _)| !finished.contains(id));
            });
        }
    }
}
