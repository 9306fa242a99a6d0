//! End-to-end delivery properties across registry, engine and clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pushwire_core::{
    Client, ConnectionListener, EngineConfig, LifecycleState, Payload, SubscriptionEngine,
};
use pushwire_protocol::{comet, DirectParser};
use pushwire_transport::{
    ChannelConnection, Connection, ConnectionId, MemoryConnection, Request, TransportKind,
};
use std::time::Duration;

fn connect(
    engine: &SubscriptionEngine,
    uid: &str,
    kind: TransportKind,
) -> (Arc<dyn Client>, Arc<MemoryConnection>) {
    let conn = Arc::new(MemoryConnection::new(format!("conn-{uid}")));
    let client = engine
        .registry()
        .find_or_create(&Request::new(uid, kind).with_connection(conn.clone()))
        .unwrap();
    client.on_connect();
    (client, conn)
}

#[test]
fn exactly_once_then_never_after_unsubscribe() {
    let engine = SubscriptionEngine::new();
    let (client, conn) = connect(&engine, "u1", TransportKind::Direct);

    engine.subscribe(&client, "T");
    engine.publish("T", Arc::new(Payload::new("T").with_field("n", "1")));
    assert_eq!(DirectParser::new().push(&conn.concat()).len(), 1);

    engine.unsubscribe(&client, "T");
    engine.publish("T", Arc::new(Payload::new("T").with_field("n", "2")));
    assert_eq!(DirectParser::new().push(&conn.concat()).len(), 1);
}

#[test]
fn comet_round_trip_keeps_fields() {
    let engine = SubscriptionEngine::new();
    let (client, conn) = connect(&engine, "browser", TransportKind::Comet);
    engine.subscribe(&client, "AAPL");

    engine.publish(
        "AAPL",
        Arc::new(Payload::new("AAPL").with_field("price", "101.5")),
    );

    let decoded = comet::decode_scripts(&conn.written_text().concat()).unwrap();
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].len(), 2);
    assert_eq!(decoded[0]["topic"], "AAPL");
    assert_eq!(decoded[0]["price"], "101.5");
}

#[test]
fn comet_round_trip_with_timestamp() {
    let engine = SubscriptionEngine::new();
    let (client, conn) = connect(&engine, "browser", TransportKind::Comet);
    engine.subscribe(&client, "AAPL");

    let mut payload = Payload::new("AAPL").with_field("price", "101.5");
    payload.toggle_timestamping(true);
    engine.publish("AAPL", Arc::new(payload));

    let decoded = comet::decode_scripts(&conn.written_text().concat()).unwrap();
    assert_eq!(decoded[0].len(), 3);
    assert!(decoded[0]["timestamp"].as_str().unwrap().parse::<u128>().is_ok());
}

#[test]
fn comet_queue_flushes_in_order_on_connect() {
    let engine = SubscriptionEngine::new();
    let client = engine
        .registry()
        .find_or_create(&Request::new("late", TransportKind::Comet))
        .unwrap();
    engine.subscribe(&client, "T");

    for n in 0..1000 {
        engine.publish("T", Arc::new(Payload::new("T").with_field("n", n.to_string())));
    }
    assert_eq!(client.state(), LifecycleState::Unbound);

    let conn = Arc::new(MemoryConnection::new("stream"));
    client.set_connection(conn.clone());
    client.on_connect();

    let decoded = comet::decode_scripts(&conn.written_text().concat()).unwrap();
    assert_eq!(decoded.len(), 1000);
    assert!(decoded
        .iter()
        .enumerate()
        .all(|(n, f)| f["n"] == n.to_string()));
    assert_eq!(client.queued_messages(), "[]");
}

struct LostCounter(AtomicUsize);

impl ConnectionListener for LostCounter {
    fn client_connected(&self, _client: &Arc<dyn Client>) {}

    fn client_lost_connection(&self, _client: &Arc<dyn Client>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn client_disconnected(&self, _client: &Arc<dyn Client>) {}
}

#[test]
fn comet_overflow_forces_lost_connection() {
    let listener = Arc::new(LostCounter(AtomicUsize::new(0)));
    let weak: std::sync::Weak<dyn ConnectionListener> = {
        let w: std::sync::Weak<LostCounter> = Arc::downgrade(&listener);
        w
    };
    let client = pushwire_core::CometClient::new("q", weak);

    for n in 0..1000 {
        client.send("T", &Arc::new(Payload::new("T").with_field("n", n.to_string())));
    }
    assert_eq!(listener.0.load(Ordering::SeqCst), 0);

    client.send("T", &Arc::new(Payload::new("T")));
    assert_eq!(client.state(), LifecycleState::LostConnection);
    assert_eq!(listener.0.load(Ordering::SeqCst), 1);

    client.lost_connection();
    assert_eq!(listener.0.load(Ordering::SeqCst), 1);
}

#[test]
fn registry_overflow_evicts_first_client() {
    let engine = SubscriptionEngine::with_config(EngineConfig {
        max_clients: 4,
        ..Default::default()
    });
    let (first, first_conn) = connect(&engine, "c0", TransportKind::WebSocket);
    engine.subscribe(&first, "T");
    for i in 1..4 {
        connect(&engine, &format!("c{i}"), TransportKind::Direct);
    }
    assert_eq!(engine.registry_stats().total_clients, 4);

    connect(&engine, "c4", TransportKind::Direct);

    assert!(first_conn.is_closed());
    assert_eq!(first.state(), LifecycleState::Destroyed);
    assert_eq!(engine.subscriber_count("T"), 0);
    assert!(engine.registry().find("c0").is_none());
    assert!(engine.registry().find("c1").is_some());
    assert_eq!(engine.registry_stats().total_clients, 4);
}

#[test]
fn concurrent_publishes_do_not_cross_deliver() {
    let engine = SubscriptionEngine::new();
    let mut subscribers = Vec::new();
    for i in 0..50 {
        let (client, conn) = connect(&engine, &format!("sub-{i}"), TransportKind::Direct);
        engine.subscribe(&client, &format!("topic-{i}"));
        subscribers.push(conn);
    }

    thread::scope(|scope| {
        for i in 0..50 {
            let engine = &engine;
            scope.spawn(move || {
                let topic = format!("topic-{i}");
                for n in 0..20 {
                    let payload = Payload::new(topic.as_str()).with_field("n", n.to_string());
                    assert_eq!(engine.publish(&topic, Arc::new(payload)), 1);
                }
            });
        }
    });

    for (i, conn) in subscribers.iter().enumerate() {
        let messages = DirectParser::new().push(&conn.concat());
        assert_eq!(messages.len(), 20);
        let expected = format!(r#""topic":"topic-{i}""#);
        assert!(messages.iter().all(|m| m.contains(&expected)));
        for (n, message) in messages.iter().enumerate() {
            assert!(message.contains(&format!(r#""n":"{n}""#)));
        }
    }
}

#[test]
fn concurrent_subscribe_and_publish_keep_index_mirrored() {
    let engine = SubscriptionEngine::new();
    let clients: Vec<_> = (0..20)
        .map(|i| connect(&engine, &format!("c{i}"), TransportKind::WebSocket).0)
        .collect();

    thread::scope(|scope| {
        for client in &clients {
            let engine = &engine;
            scope.spawn(move || {
                for round in 0..50 {
                    engine.subscribe(client, "shared");
                    engine.publish("shared", Arc::new(Payload::new("shared")));
                    if round % 2 == 0 {
                        engine.unsubscribe(client, "shared");
                    }
                }
            });
        }
    });

    for client in &clients {
        let in_index = engine
            .subscribers("shared")
            .iter()
            .any(|c| c.uid() == client.uid());
        assert_eq!(client.is_subscribed("shared"), in_index);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_subscriber_is_dropped_without_blocking_fan_out() {
    let engine = SubscriptionEngine::with_config(EngineConfig {
        reconnect_grace: Duration::from_secs(60),
        ..Default::default()
    });

    // Nothing drains this buffer.
    let (slow_conn, _outbound) = ChannelConnection::new(ConnectionId::new("slow"), 2);
    let slow = engine
        .registry()
        .find_or_create(&Request::new("slow", TransportKind::Direct).with_connection(slow_conn.clone()))
        .unwrap();
    slow.on_connect();
    let (fast, fast_conn) = connect(&engine, "fast", TransportKind::Direct);
    engine.subscribe(&slow, "T");
    engine.subscribe(&fast, "T");

    for n in 0..4 {
        let payload = Payload::new("T").with_field("n", n.to_string());
        engine.publish("T", Arc::new(payload));
    }

    assert_eq!(slow.state(), LifecycleState::LostConnection);
    assert!(slow_conn.is_closed());
    assert_eq!(DirectParser::new().push(&fast_conn.concat()).len(), 4);
    assert!(fast.is_connected());
    assert_eq!(engine.stats().pending_purges, 1);
}
