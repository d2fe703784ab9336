#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hass_link::{
    Connection, ConnectionOptions, DispatchQueue, EventHandlers, HassLinkError, HttpMethod,
    JsonMap, RestChannel, StaticConfiguration, Transport, TransportEvent, TransportEventSink,
    TransportFactory, WriteCompletion,
};
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};

pub const ENDPOINT: &str = "ws://hass.test:8123/api/websocket";
pub const TOKEN: &str = "test-token";
pub const VERSION: &str = "2024.1.0";

/// Transport whose socket is driven by the test.
pub struct MockTransport {
    endpoint: String,
    sink: TransportEventSink,
    record: Mutex<Record>,
}

#[derive(Default)]
struct Record {
    connects: usize,
    disconnects: Vec<u16>,
    texts: Vec<String>,
    binaries: Vec<Vec<u8>>,
}

impl MockTransport {
    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(event);
    }

    pub fn receive(&self, frame: JsonValue) {
        self.emit(TransportEvent::Text(frame.to_string()));
    }

    pub fn connects(&self) -> usize {
        self.record.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> Vec<u16> {
        self.record.lock().unwrap().disconnects.clone()
    }

    /// Every text frame written so far, parsed.
    pub fn sent(&self) -> Vec<JsonValue> {
        self.record
            .lock()
            .unwrap()
            .texts
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    /// Text frames written so far, excluding `auth`.
    pub fn sent_commands(&self) -> Vec<JsonValue> {
        self.sent()
            .into_iter()
            .filter(|frame| frame["type"] != "auth")
            .collect()
    }

    pub fn binaries(&self) -> Vec<Vec<u8>> {
        self.record.lock().unwrap().binaries.clone()
    }

    pub fn clear_sent(&self) {
        self.record.lock().unwrap().texts.clear();
    }
}

impl Transport for MockTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self) {
        self.record.lock().unwrap().connects += 1;
    }

    fn disconnect(&self, code: u16) {
        self.record.lock().unwrap().disconnects.push(code);
    }

    fn write_text(&self, text: String, done: WriteCompletion) {
        self.record.lock().unwrap().texts.push(text);
        done(Ok(()));
    }

    fn write_binary(&self, data: Bytes, done: WriteCompletion) {
        self.record.lock().unwrap().binaries.push(data.to_vec());
        done(Ok(()));
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn latest(&self) -> Arc<MockTransport> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no transport created yet")
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, endpoint: &str, events: TransportEventSink) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport {
            endpoint: endpoint.to_string(),
            sink: events,
            record: Mutex::new(Record::default()),
        });
        self.created.lock().unwrap().push(transport.clone());
        transport
    }
}

/// Rest channel answering every request with a canned reply.
pub struct MockRestChannel {
    reply: Mutex<Result<JsonValue, HassLinkError>>,
    pub calls: Mutex<Vec<(String, String, HttpMethod, String, JsonMap)>>,
}

impl MockRestChannel {
    pub fn replying(reply: Result<JsonValue, HassLinkError>) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RestChannel for MockRestChannel {
    async fn send(
        &self,
        endpoint: &str,
        token: &str,
        method: HttpMethod,
        path: &str,
        body: JsonMap,
    ) -> hass_link::Result<JsonValue> {
        self.calls.lock().unwrap().push((
            endpoint.to_string(),
            token.to_string(),
            method,
            path.to_string(),
            body,
        ));
        self.reply.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub connection: Connection,
    pub factory: Arc<MockTransportFactory>,
    pub configuration: Arc<StaticConfiguration>,
    pub rest: Arc<MockRestChannel>,
}

/// Options with no retry-trigger subscriptions, so frame numbering starts at 1.
pub fn quiet_options() -> ConnectionOptions {
    ConnectionOptions::new()
        .with_retry_subscription_events(Vec::new())
        .with_reconnect_delay_ms(1000)
        .with_reconnect_tolerance_ms(0)
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(quiet_options())
    }

    pub fn with_options(options: ConnectionOptions) -> Self {
        Self::build(options, EventHandlers::new())
    }

    pub fn with_handlers(handlers: EventHandlers) -> Self {
        Self::build(quiet_options(), handlers)
    }

    /// Like [`Harness::new`], on the serial queues a default connection uses.
    /// Callbacks run on their own tasks; call [`Harness::drain`] before asserting.
    pub fn serial() -> Self {
        Self::build_on(
            quiet_options(),
            EventHandlers::new(),
            DispatchQueue::serial("test-work"),
            DispatchQueue::serial("test-callback"),
        )
    }

    pub fn build(options: ConnectionOptions, handlers: EventHandlers) -> Self {
        Self::build_on(
            options,
            handlers,
            DispatchQueue::inline("work"),
            DispatchQueue::inline("callback"),
        )
    }

    fn build_on(
        options: ConnectionOptions,
        handlers: EventHandlers,
        work: DispatchQueue,
        callback: DispatchQueue,
    ) -> Self {
        let factory = Arc::new(MockTransportFactory::default());
        let configuration = Arc::new(StaticConfiguration::new(ENDPOINT, TOKEN));
        let rest = Arc::new(MockRestChannel::replying(Ok(json!({"message": "API running."}))));
        let connection = Connection::builder(configuration.clone())
            .connection_options(options)
            .event_handlers(handlers)
            .transport_factory(factory.clone())
            .rest_channel(rest.clone())
            .dispatch_queues(work, callback)
            .build()
            .unwrap();

        Self {
            connection,
            factory,
            configuration,
            rest,
        }
    }

    pub fn transport(&self) -> Arc<MockTransport> {
        self.factory.latest()
    }

    /// Run every job queued so far, including the jobs those jobs queue.
    pub async fn drain(&self) {
        for _ in 0..4 {
            self.connection.flush().await;
            settle().await;
        }
    }

    /// Connect and complete the handshake.
    pub async fn connect_and_authenticate(&self) -> Arc<MockTransport> {
        self.connection.connect();
        let transport = self.transport();
        authenticate(&transport).await;
        self.drain().await;
        assert!(self.connection.phase().is_command());
        transport
    }
}

/// Open the socket, answer `auth_required` and accept the token.
pub async fn authenticate(transport: &MockTransport) {
    transport.emit(TransportEvent::Connected);
    transport.receive(json!({"type": "auth_required", "ha_version": VERSION}));
    settle().await;
    assert_eq!(
        transport.sent().last(),
        Some(&json!({"type": "auth", "access_token": TOKEN}))
    );
    transport.receive(json!({"type": "auth_ok", "ha_version": VERSION}));
    settle().await;
}

/// Let spawned tasks (token fetches, Rest calls) run to completion.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub fn result_ok(id: u64, result: JsonValue) -> JsonValue {
    json!({"id": id, "type": "result", "success": true, "result": result})
}

pub fn result_err(id: u64, code: &str, message: &str) -> JsonValue {
    json!({
        "id": id,
        "type": "result",
        "success": false,
        "error": {"code": code, "message": message},
    })
}

pub fn event(id: u64, event: JsonValue) -> JsonValue {
    json!({"id": id, "type": "event", "event": event})
}

/// Collects values handed to callbacks.
pub fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + Clone) {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = values.clone();
    (values, move |value| sink.lock().unwrap().push(value))
}
