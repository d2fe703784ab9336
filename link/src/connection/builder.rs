use super::{Connection, ConnectionInner, ObserverList, TransportLink};
use crate::{
    clock::{Clock, SystemClock},
    configuration::ConnectionConfiguration,
    dispatch::DispatchQueue,
    error::{HassLinkError, Result},
    event_handlers::EventHandlers,
    models::ConnectionOptions,
    multiplexer::{Multiplexer, MultiplexerDelegate},
    protected::Protected,
    reconnect::ReconnectScheduler,
    response::{ResponseController, ResponseDelegate},
    rest::{HttpRestChannel, RestChannel},
    timeouts::HassLinkTimeouts,
    transport::{TransportFactory, WebSocketTransportFactory},
};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    configuration: Arc<dyn ConnectionConfiguration>,
    options: ConnectionOptions,
    timeouts: HassLinkTimeouts,
    event_handlers: EventHandlers,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    rest_channel: Option<Arc<dyn RestChannel>>,
    clock: Arc<dyn Clock>,
    queues: Option<(DispatchQueue, DispatchQueue)>,
}

impl ConnectionBuilder {
    pub(super) fn new(configuration: Arc<dyn ConnectionConfiguration>) -> Self {
        Self {
            configuration,
            options: ConnectionOptions::default(),
            timeouts: HassLinkTimeouts::default(),
            event_handlers: EventHandlers::default(),
            transport_factory: None,
            rest_channel: None,
            clock: Arc::new(SystemClock),
            queues: None,
        }
    }

    /// Set reconnect and subscription retry behavior.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use hass_link::{Connection, ConnectionOptions, StaticConfiguration};
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> hass_link::Result<()> {
    /// let connection = Connection::builder(Arc::new(StaticConfiguration::new(
    ///     "ws://localhost:8123/api/websocket",
    ///     "token",
    /// )))
    /// .connection_options(ConnectionOptions::new().with_reconnect_delay_ms(1000))
    /// .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set socket and HTTP timeouts.
    pub fn timeouts(mut self, timeouts: HassLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set connection lifecycle callbacks.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use hass_link::{Connection, EventHandlers, StaticConfiguration};
    /// use std::sync::Arc;
    ///
    /// # async fn example() -> hass_link::Result<()> {
    /// let connection = Connection::builder(Arc::new(StaticConfiguration::new(
    ///     "ws://localhost:8123/api/websocket",
    ///     "token",
    /// )))
    /// .event_handlers(
    ///     EventHandlers::new()
    ///         .on_state_change(|state| println!("state: {:?}", state))
    ///         .on_error(|err| eprintln!("error: {}", err)),
    /// )
    /// .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Replace the WebSocket transport, e.g. with a scripted one in tests.
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Replace the HTTP channel used for REST requests.
    pub fn rest_channel(mut self, channel: Arc<dyn RestChannel>) -> Self {
        self.rest_channel = Some(channel);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use the given work and callback queues instead of spawning serial ones.
    pub fn dispatch_queues(mut self, work: DispatchQueue, callback: DispatchQueue) -> Self {
        self.queues = Some((work, callback));
        self
    }

    /// Build the connection. Nothing is opened until
    /// [`Connection::connect`] is called.
    ///
    /// Without explicit queues this must run inside a tokio runtime.
    pub fn build(self) -> Result<Connection> {
        let (work_queue, callback_queue) = match self.queues {
            Some(queues) => queues,
            None => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(HassLinkError::ConfigurationError(
                        "Connection requires a tokio runtime".to_string(),
                    ));
                }
                (
                    DispatchQueue::serial("hass-link.work"),
                    DispatchQueue::serial("hass-link.callback"),
                )
            },
        };

        let transport_factory = match self.transport_factory {
            Some(factory) => factory,
            None => Arc::new(WebSocketTransportFactory::new(self.timeouts.clone())),
        };
        let rest_channel: Arc<dyn RestChannel> = match self.rest_channel {
            Some(channel) => channel,
            None => Arc::new(HttpRestChannel::new(&self.timeouts)?),
        };

        let options = self.options;
        let handlers = self.event_handlers;
        let clock = self.clock;
        let configuration = self.configuration;

        let inner = Arc::new_cyclic(|weak_self: &Weak<ConnectionInner>| {
            let response_delegate: Weak<dyn ResponseDelegate> = weak_self.clone();
            let multiplexer_delegate: Weak<dyn MultiplexerDelegate> = weak_self.clone();

            ConnectionInner {
                response: ResponseController::new(
                    work_queue.clone(),
                    callback_queue.clone(),
                    handlers.clone(),
                    response_delegate,
                ),
                multiplexer: Multiplexer::new(
                    multiplexer_delegate,
                    clock.clone(),
                    callback_queue.clone(),
                    Duration::from_millis(options.retry_subscriptions_delay_ms),
                ),
                reconnect: ReconnectScheduler::new(
                    Duration::from_millis(options.reconnect_delay_ms),
                    Duration::from_millis(options.reconnect_tolerance_ms),
                    clock.clone(),
                    callback_queue.clone(),
                ),
                configuration,
                options,
                transport_factory,
                rest_channel,
                handlers,
                work_queue,
                callback_queue,
                link: Protected::new(TransportLink::default()),
                observers: Protected::new(ObserverList::default()),
                auth_attempt: AtomicU64::new(0),
                retry_triggers: Mutex::new(Vec::new()),
                weak_self: weak_self.clone(),
            }
        });

        let weak_inner = Arc::downgrade(&inner);
        inner.reconnect.set_on_reconnect(move || {
            if let Some(inner) = weak_inner.upgrade() {
                inner.reconnect_now();
            }
        });
        inner.install_retry_triggers();

        Ok(Connection { inner })
    }
}
