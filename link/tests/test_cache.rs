//! Integration tests for populate/subscribe caches on a scripted connection.

use hass_link::{
    Cache, CacheResponse, Connection, PopulateInfo, Request, SubscribeInfo, SubscriptionPhase,
    TransportEvent,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

use common::{collector, event, result_err, result_ok, Harness};

#[derive(Debug, Clone, Deserialize)]
struct Thing {
    uuid: String,
}

fn thing_cache(connection: &Connection) -> Cache<String> {
    Cache::new(
        connection,
        Some(PopulateInfo::new(
            Request::new("get_thing"),
            |thing: Thing, _current: Option<&String>| thing.uuid,
        )),
        vec![SubscribeInfo::new(
            Request::subscribe_events(Some("thing_changed")),
            |thing: Thing, _current: Option<&String>, _phase| {
                if thing.uuid == "stale" {
                    CacheResponse::ReissuePopulate
                } else if thing.uuid.is_empty() {
                    CacheResponse::Ignore
                } else {
                    CacheResponse::Replace(thing.uuid)
                }
            },
        )],
    )
}

fn populate_frame(id: u64) -> JsonValue {
    json!({"id": id, "type": "get_thing"})
}

fn subscribe_frame(id: u64) -> JsonValue {
    json!({"id": id, "type": "subscribe_events", "event_type": "thing_changed"})
}

#[tokio::test]
async fn test_populate_then_replace_notifies_once_per_value() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();

    let _token = cache.subscribe(move |_, value| on_value(value));
    assert_eq!(transport.sent_commands(), vec![populate_frame(1)]);

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    assert_eq!(*values.lock().unwrap(), vec!["A".to_string()]);
    assert_eq!(transport.sent_commands().last(), Some(&subscribe_frame(2)));

    transport.receive(result_ok(2, JsonValue::Null));
    transport.receive(event(2, json!({"uuid": "B"})));

    assert_eq!(cache.current(), Some("B".to_string()));
    assert_eq!(*values.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn test_cache_waits_for_authentication() {
    let harness = Harness::new();
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.subscribe(move |_, value| on_value(value));

    harness.connection.connect();
    let transport = harness.transport();
    assert!(transport.sent_commands().is_empty());

    common::authenticate(&transport).await;
    assert_eq!(transport.sent_commands(), vec![populate_frame(1)]);

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    assert_eq!(*values.lock().unwrap(), vec!["A".to_string()]);
}

#[tokio::test]
async fn test_late_subscriber_gets_current_value_immediately() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let _first = cache.subscribe(|_, _| {});
    transport.receive(result_ok(1, json!({"uuid": "A"})));

    let (values, on_value) = collector::<String>();
    let _second = cache.subscribe(move |_, value| on_value(value));

    assert_eq!(*values.lock().unwrap(), vec!["A".to_string()]);
    // The second subscriber does not start another populate.
    assert_eq!(transport.sent_commands().len(), 2);
}

#[tokio::test]
async fn test_reissue_populate_and_ignore() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.subscribe(move |_, value| on_value(value));

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(event(2, json!({"uuid": ""})));
    assert_eq!(values.lock().unwrap().len(), 1);

    transport.receive(event(2, json!({"uuid": "stale"})));
    assert_eq!(transport.sent_commands().last(), Some(&populate_frame(3)));

    transport.receive(result_ok(3, json!({"uuid": "C"})));
    assert_eq!(*values.lock().unwrap(), vec!["A".to_string(), "C".to_string()]);
    // A reissued populate does not open the subscription again.
    assert_eq!(transport.sent_commands().len(), 3);
}

#[tokio::test]
async fn test_populate_failure_leaves_cache_empty() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.subscribe(move |_, value| on_value(value));

    transport.receive(result_err(1, "not_found", "No thing"));

    assert!(values.lock().unwrap().is_empty());
    assert_eq!(cache.current(), None);
    assert_eq!(transport.sent_commands().len(), 1);
}

#[tokio::test]
async fn test_undecodable_populate_is_dropped() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let _token = cache.subscribe(|_, _| {});

    transport.receive(result_ok(1, json!({"no_uuid": true})));

    assert_eq!(cache.current(), None);
    assert_eq!(transport.sent_commands().len(), 1);
}

#[tokio::test]
async fn test_subscription_phase_tags_first_event() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let phases = Arc::new(Mutex::new(Vec::new()));
    let sink = phases.clone();
    let cache: Cache<u64> = Cache::new(
        &harness.connection,
        None,
        vec![SubscribeInfo::new(
            Request::subscribe_events(Some("tick")),
            move |n: u64, _current: Option<&u64>, phase| {
                sink.lock().unwrap().push(phase);
                CacheResponse::Replace(n)
            },
        )],
    );
    let _token = cache.subscribe(|_, _| {});

    transport.receive(result_ok(1, JsonValue::Null));
    transport.receive(event(1, json!(1)));
    transport.receive(event(1, json!(2)));

    assert_eq!(
        *phases.lock().unwrap(),
        vec![SubscriptionPhase::Initial, SubscriptionPhase::Iteration]
    );
    assert_eq!(cache.current(), Some(2));
}

#[tokio::test]
async fn test_last_subscriber_resets_when_configured() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    cache.set_should_reset_without_subscribers(true);
    let token = cache.subscribe(|_, _| {});

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(result_ok(2, JsonValue::Null));
    token.cancel();

    assert_eq!(cache.current(), None);
    assert_eq!(
        transport.sent_commands().last(),
        Some(&json!({"id": 3, "type": "unsubscribe_events", "subscription": 2}))
    );

    // A new subscriber starts over.
    let _again = cache.subscribe(|_, _| {});
    assert_eq!(transport.sent_commands().last(), Some(&populate_frame(4)));
}

#[tokio::test]
async fn test_last_subscriber_keeps_value_by_default() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let token = cache.subscribe(|_, _| {});

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    token.cancel();

    assert_eq!(cache.current(), Some("A".to_string()));
    assert_eq!(transport.sent_commands().len(), 2);
}

#[tokio::test]
async fn test_dropping_cache_and_token_unsubscribes() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let token = cache.subscribe(|_, _| {});
    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(result_ok(2, JsonValue::Null));

    drop(cache);
    assert_eq!(transport.sent_commands().len(), 2);
    drop(token);

    assert_eq!(
        transport.sent_commands().last(),
        Some(&json!({"id": 3, "type": "unsubscribe_events", "subscription": 2}))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restarts_cache() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.subscribe(move |_, value| on_value(value));
    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(result_ok(2, JsonValue::Null));

    transport.emit(TransportEvent::PeerClosed);
    tokio::time::sleep(Duration::from_millis(1001)).await;
    common::settle().await;
    transport.clear_sent();
    common::authenticate(&transport).await;

    assert_eq!(transport.sent_commands(), vec![populate_frame(3)]);
    transport.receive(result_ok(3, json!({"uuid": "D"})));
    assert_eq!(transport.sent_commands().last(), Some(&subscribe_frame(4)));

    // Events for the old subscription identifier no longer reach the cache.
    transport.receive(event(2, json!({"uuid": "old"})));
    transport.receive(event(4, json!({"uuid": "E"})));
    assert_eq!(
        *values.lock().unwrap(),
        vec!["A".to_string(), "D".to_string(), "E".to_string()]
    );
}

#[tokio::test]
async fn test_once_on_connection_cache() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.once(on_value);

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(result_ok(2, JsonValue::Null));
    transport.receive(event(2, json!({"uuid": "B"})));

    assert_eq!(*values.lock().unwrap(), vec!["A".to_string()]);
}

#[tokio::test]
async fn test_mapped_cache_follows_connection_cache() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let lengths = thing_cache(&harness.connection).map(|uuid| uuid.len());
    let (values, on_value) = collector::<usize>();
    let token = lengths.subscribe(move |_, value| on_value(value));

    transport.receive(result_ok(1, json!({"uuid": "abc"})));
    transport.receive(result_ok(2, JsonValue::Null));
    transport.receive(event(2, json!({"uuid": "abcdef"})));
    assert_eq!(*values.lock().unwrap(), vec![3, 6]);

    token.cancel();
    assert_eq!(lengths.current(), None);
}

#[tokio::test]
async fn test_reissued_populates_replace_each_other() {
    let harness = Harness::new();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let _token = cache.subscribe(|_, _| {});
    transport.receive(result_ok(1, json!({"uuid": "A"})));
    transport.receive(result_ok(2, JsonValue::Null));

    for round in 0..20u64 {
        transport.receive(event(2, json!({"uuid": "stale"})));
        transport.receive(result_ok(3 + round, json!({"uuid": format!("v{}", round)})));
    }

    assert_eq!(cache.current(), Some("v19".to_string()));
    // One populate and one subscription, however many reissues came before.
    let debug = format!("{:?}", cache);
    assert!(debug.contains("requests: 2"), "{}", debug);
}

// ── serial queues ────────────────────────────────────────────────────────────

fn counter_cache(connection: &Connection) -> Cache<u64> {
    Cache::new(
        connection,
        None,
        vec![SubscribeInfo::new(
            Request::subscribe_events(Some("tick")),
            |n: u64, current: Option<&u64>, _phase| {
                CacheResponse::Replace(current.copied().unwrap_or(0) + n)
            },
        )],
    )
}

#[tokio::test]
async fn test_serial_queues_keep_every_accumulated_update() {
    let harness = Harness::serial();
    let transport = harness.connect_and_authenticate().await;
    let cache = counter_cache(&harness.connection);
    let (values, on_value) = collector::<u64>();
    let _token = cache.subscribe(move |_, value| on_value(value));
    harness.drain().await;
    assert_eq!(
        transport.sent_commands(),
        vec![json!({"id": 1, "type": "subscribe_events", "event_type": "tick"})]
    );

    transport.receive(result_ok(1, JsonValue::Null));
    for _ in 0..500 {
        transport.receive(event(1, json!(1)));
    }
    harness.drain().await;

    assert_eq!(cache.current(), Some(500));
    assert_eq!(*values.lock().unwrap(), (1..=500).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_serial_queues_deliver_populate_before_events() {
    let harness = Harness::serial();
    let transport = harness.connect_and_authenticate().await;
    let cache = thing_cache(&harness.connection);
    let (values, on_value) = collector::<String>();
    let _token = cache.subscribe(move |_, value| on_value(value));
    harness.drain().await;
    assert_eq!(transport.sent_commands(), vec![populate_frame(1)]);

    transport.receive(result_ok(1, json!({"uuid": "A"})));
    harness.drain().await;
    assert_eq!(transport.sent_commands().last(), Some(&subscribe_frame(2)));

    transport.receive(result_ok(2, JsonValue::Null));
    transport.receive(event(2, json!({"uuid": "B"})));
    transport.receive(event(2, json!({"uuid": ""})));
    transport.receive(event(2, json!({"uuid": "C"})));
    harness.drain().await;

    assert_eq!(
        *values.lock().unwrap(),
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    );
    assert_eq!(cache.current(), Some("C".to_string()));
}
