//! Streaming adapters: external publishers on their own socket.
//!
//! An adapter publishes into the engine and may register itself as a
//! subscribe/unsubscribe or publish listener. Registered adapters are
//! [`RemoteAdapter`]s whose callbacks become `@@@@`-framed events on the
//! adapter's socket. When that socket fails or closes, the adapter is
//! removed from every listener set it joined.

use bytes::Bytes;
use parking_lot::Mutex;
use pushwire_protocol::{adapter, AdapterInstruction, DirectParser};
use pushwire_transport::{Connection, ConnectionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::engine::SubscriptionEngine;
use crate::listener::{PublishListener, SubscribeListener, UnsubscribeListener};
use crate::payload::{Payload, TOPIC_FIELD};
use crate::session::{Flow, DEFAULT_MAX_PENDING, READ_BUFFER_SIZE};

/// A streaming adapter seen as an engine listener.
pub struct RemoteAdapter {
    uid: String,
    connection: Arc<dyn Connection>,
    adapters: Weak<AdapterRegistry>,
    lost: AtomicBool,
}

impl RemoteAdapter {
    /// Adapter identifier.
    #[must_use]
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Identifier of the adapter's socket.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Whether the adapter's socket has failed or closed.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire) || self.connection.is_closed()
    }

    fn emit(&self, event: Bytes) {
        if self.lost.load(Ordering::Acquire) {
            return;
        }
        let Err(e) = self.connection.write(event) else {
            return;
        };

        if e.is_closed() {
            info!(adapter = %self.uid, "Adapter connection closed during write");
        } else {
            error!(adapter = %self.uid, error = %e, "Error writing to adapter, closing");
        }
        self.connection.close();
        if !self.lost.swap(true, Ordering::AcqRel) {
            if let Some(adapters) = self.adapters.upgrade() {
                adapters.connection_lost(&self.uid, self.connection.id());
            }
        }
    }
}

impl SubscribeListener for RemoteAdapter {
    fn on_subscribe(&self, topic: &str, client: &Arc<dyn Client>) {
        self.emit(adapter::on_subscribe(topic, client.uid()));
    }
}

impl UnsubscribeListener for RemoteAdapter {
    fn on_unsubscribe(&self, topic: &str, client: &Arc<dyn Client>) {
        self.emit(adapter::on_unsubscribe(topic, client.uid()));
    }
}

impl PublishListener for RemoteAdapter {
    fn on_publish(&self, client: &Arc<dyn Client>, topic: &str, payload: &Arc<Payload>) {
        self.emit(adapter::on_message_received(
            client.uid(),
            topic,
            payload.to_text(),
        ));
    }
}

/// Adapters by uid, and their listener registrations with the engine.
pub struct AdapterRegistry {
    engine: Arc<SubscriptionEngine>,
    adapters: Mutex<HashMap<String, Arc<RemoteAdapter>>>,
    me: Weak<AdapterRegistry>,
}

impl AdapterRegistry {
    /// Create a registry registering adapters with `engine`.
    #[must_use]
    pub fn new(engine: Arc<SubscriptionEngine>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| Self {
            engine,
            adapters: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// The engine adapters publish into.
    #[must_use]
    pub fn engine(&self) -> &Arc<SubscriptionEngine> {
        &self.engine
    }

    /// Find the adapter named `uid`, creating it on `connection` if it is
    /// unknown or its previous socket is gone.
    pub fn find_or_create(&self, uid: &str, connection: &Arc<dyn Connection>) -> Arc<RemoteAdapter> {
        let (adapter, stale) = {
            let mut adapters = self.adapters.lock();
            match adapters.get(uid) {
                Some(existing) if !existing.is_lost() => return Arc::clone(existing),
                _ => {
                    let adapter = Arc::new(RemoteAdapter {
                        uid: uid.to_string(),
                        connection: Arc::clone(connection),
                        adapters: self.me.clone(),
                        lost: AtomicBool::new(false),
                    });
                    let stale = adapters.insert(uid.to_string(), Arc::clone(&adapter));
                    (adapter, stale)
                }
            }
        };

        if let Some(stale) = stale {
            self.deregister(&stale);
        }
        debug!(adapter = %uid, connection = %connection.id(), "Created remote adapter");
        adapter
    }

    /// Look up an adapter.
    #[must_use]
    pub fn get(&self, uid: &str) -> Option<Arc<RemoteAdapter>> {
        self.adapters.lock().get(uid).cloned()
    }

    /// Number of known adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.lock().len()
    }

    /// Whether no adapters are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.lock().is_empty()
    }

    /// Send subscribe and unsubscribe events to `adapter`.
    pub fn add_subscription_listener(&self, adapter: &Arc<RemoteAdapter>) {
        info!(adapter = %adapter.uid, "Adding adapter as subscription listener");
        self.engine.add_subscribe_listener(Arc::clone(adapter) as Arc<dyn SubscribeListener>);
        self.engine.add_unsubscribe_listener(Arc::clone(adapter) as Arc<dyn UnsubscribeListener>);
    }

    /// Stop sending subscription events to `adapter`.
    pub fn remove_subscription_listener(&self, adapter: &Arc<RemoteAdapter>) {
        info!(adapter = %adapter.uid, "Removing adapter as subscription listener");
        self.engine.remove_subscribe_listener(&(Arc::clone(adapter) as Arc<dyn SubscribeListener>));
        self.engine
            .remove_unsubscribe_listener(&(Arc::clone(adapter) as Arc<dyn UnsubscribeListener>));
    }

    /// Send client publishes to `adapter`.
    pub fn add_publish_listener(&self, adapter: &Arc<RemoteAdapter>) {
        info!(adapter = %adapter.uid, "Adding adapter as publish listener");
        self.engine.add_publish_listener(Arc::clone(adapter) as Arc<dyn PublishListener>);
    }

    /// Stop sending client publishes to `adapter`.
    pub fn remove_publish_listener(&self, adapter: &Arc<RemoteAdapter>) {
        info!(adapter = %adapter.uid, "Removing adapter as publish listener");
        self.engine.remove_publish_listener(&(Arc::clone(adapter) as Arc<dyn PublishListener>));
    }

    /// The socket `connection` of adapter `uid` is gone.
    ///
    /// Removes the adapter and all of its registrations if it is still bound
    /// to that socket. Returns whether anything was removed.
    pub fn connection_lost(&self, uid: &str, connection: &ConnectionId) -> bool {
        let removed = {
            let mut adapters = self.adapters.lock();
            match adapters.get(uid) {
                Some(current) if current.connection_id() == connection => adapters.remove(uid),
                _ => None,
            }
        };
        let Some(adapter) = removed else {
            return false;
        };

        adapter.lost.store(true, Ordering::Release);
        self.deregister(&adapter);
        info!(adapter = %uid, "Adapter connection lost, listeners removed");
        true
    }

    fn deregister(&self, adapter: &Arc<RemoteAdapter>) {
        self.engine.remove_subscribe_listener(&(Arc::clone(adapter) as Arc<dyn SubscribeListener>));
        self.engine
            .remove_unsubscribe_listener(&(Arc::clone(adapter) as Arc<dyn UnsubscribeListener>));
        self.engine.remove_publish_listener(&(Arc::clone(adapter) as Arc<dyn PublishListener>));
    }
}

/// One streaming adapter socket.
pub struct AdapterSession {
    adapters: Arc<AdapterRegistry>,
    connection: Arc<dyn Connection>,
    parser: DirectParser,
    uid: Option<String>,
    max_pending: usize,
}

impl AdapterSession {
    /// Create a session writing events back through `connection`.
    #[must_use]
    pub fn new(adapters: Arc<AdapterRegistry>, connection: Arc<dyn Connection>) -> Self {
        Self {
            adapters,
            connection,
            parser: DirectParser::new(),
            uid: None,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Cap the bytes buffered for an incomplete message.
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// The adapter's name, once it has sent `uid=`.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Feed raw bytes read from the socket.
    pub fn feed(&mut self, chunk: &[u8]) -> Flow {
        for message in self.parser.push(chunk) {
            self.handle(&message);
        }

        if self.parser.pending() > self.max_pending {
            warn!(
                connection = %self.connection.id(),
                pending = self.parser.pending(),
                limit = self.max_pending,
                "Adapter message too large, dropping connection"
            );
            self.finish();
            return Flow::Close;
        }
        Flow::Continue
    }

    /// Apply one complete message.
    pub fn handle(&mut self, message: &str) {
        let instruction = AdapterInstruction::parse(message);
        debug!(
            connection = %self.connection.id(),
            adapter = self.uid().unwrap_or("-"),
            instruction = instruction.kind(),
            "Adapter message"
        );

        match instruction {
            AdapterInstruction::Connect { uid } => {
                info!(adapter = %uid, connection = %self.connection.id(), "Streaming adapter connected");
                self.uid = Some(uid);
            }
            AdapterInstruction::Publish { topic, payload } => self.publish(&topic, &payload),
            AdapterInstruction::Send {
                uid,
                topic,
                payload,
            } => self.send(&uid, &topic, &payload),
            AdapterInstruction::Unknown(raw) => {
                warn!(connection = %self.connection.id(), message = %raw, "Unknown adapter message");
            }
            registration => self.register(&registration),
        }
    }

    fn register(&self, instruction: &AdapterInstruction) {
        let Some(uid) = self.uid.as_deref() else {
            warn!(
                connection = %self.connection.id(),
                instruction = instruction.kind(),
                "Adapter instruction before uid, ignoring"
            );
            return;
        };

        let adapters = &self.adapters;
        match instruction {
            AdapterInstruction::AddSubscriptionListener => {
                let adapter = adapters.find_or_create(uid, &self.connection);
                adapters.add_subscription_listener(&adapter);
            }
            AdapterInstruction::AddPublishListener => {
                let adapter = adapters.find_or_create(uid, &self.connection);
                adapters.add_publish_listener(&adapter);
            }
            AdapterInstruction::RemoveSubscriptionListener => {
                if let Some(adapter) = adapters.get(uid) {
                    adapters.remove_subscription_listener(&adapter);
                }
            }
            AdapterInstruction::RemovePublishListener => {
                if let Some(adapter) = adapters.get(uid) {
                    adapters.remove_publish_listener(&adapter);
                }
            }
            _ => {}
        }
    }

    fn publish(&self, topic: &str, source: &str) {
        let mut payload = match Payload::from_json(source) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(adapter = self.uid().unwrap_or("-"), topic = %topic, error = %e, "Bad adapter payload");
                return;
            }
        };
        if payload.get(TOPIC_FIELD).is_none() {
            payload.add_field(TOPIC_FIELD, topic);
        }
        let recipients = self.adapters.engine().publish(topic, Arc::new(payload));
        debug!(adapter = self.uid().unwrap_or("-"), topic = %topic, recipients, "Adapter published");
    }

    fn send(&self, client_uid: &str, topic: &str, source: &str) {
        let Some(client) = self.adapters.engine().registry().find(client_uid) else {
            return;
        };
        match Payload::from_json(source) {
            Ok(mut payload) => {
                if payload.get(TOPIC_FIELD).is_none() {
                    payload.add_field(TOPIC_FIELD, topic);
                }
                debug!(adapter = self.uid().unwrap_or("-"), client = %client_uid, topic = %topic, "Adapter sending");
                client.send(topic, &Arc::new(payload));
            }
            Err(e) => {
                warn!(adapter = self.uid().unwrap_or("-"), topic = %topic, error = %e, "Bad adapter payload");
            }
        }
    }

    /// The socket ended. Drops the adapter's registrations.
    pub fn finish(&mut self) {
        if let Some(uid) = &self.uid {
            self.adapters.connection_lost(uid, self.connection.id());
        }
        self.connection.close();
    }

    /// Read from `reader` until the adapter goes away.
    pub async fn run<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(connection = %self.connection.id(), "Adapter closed stream");
                    break;
                }
                Ok(n) => {
                    if self.feed(&buf[..n]) == Flow::Close {
                        return;
                    }
                }
                Err(e) => {
                    debug!(connection = %self.connection.id(), error = %e, "Adapter read failed");
                    break;
                }
            }

            if self.connection.is_closed() {
                break;
            }
        }

        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushwire_protocol::direct;
    use pushwire_transport::{MemoryConnection, Request, TransportKind};
    use tokio::io::AsyncWriteExt;

    fn adapter_session(
        engine: &Arc<SubscriptionEngine>,
    ) -> (Arc<AdapterRegistry>, Arc<MemoryConnection>, AdapterSession) {
        let adapters = AdapterRegistry::new(Arc::clone(engine));
        let conn = Arc::new(MemoryConnection::new("adapter"));
        let session = AdapterSession::new(Arc::clone(&adapters), conn.clone());
        (adapters, conn, session)
    }

    fn connected(engine: &SubscriptionEngine, uid: &str) -> (Arc<dyn Client>, Arc<MemoryConnection>) {
        let conn = Arc::new(MemoryConnection::new(format!("conn-{uid}")));
        let client = engine
            .registry()
            .find_or_create(&Request::new(uid, TransportKind::Direct).with_connection(conn.clone()))
            .unwrap();
        client.on_connect();
        (client, conn)
    }

    fn events(conn: &MemoryConnection) -> Vec<String> {
        DirectParser::new().push(&conn.concat())
    }

    #[test]
    fn test_subscription_listener_reports_events() {
        let engine = SubscriptionEngine::new();
        let (_, adapter_conn, mut session) = adapter_session(&engine);
        session.feed(&direct::encode("uid=feed"));
        session.feed(&direct::encode("addSubscriptionListener"));

        let (client, _) = connected(&engine, "browser");
        engine.subscribe(&client, "AAPL");
        engine.unsubscribe(&client, "AAPL");

        assert_eq!(
            events(&adapter_conn),
            vec!["onSubscribe(AAPL,browser)", "onUnSubscribe(AAPL,browser)"]
        );

        session.feed(&direct::encode("removeSubscriptionListener"));
        engine.subscribe(&client, "MSFT");
        assert_eq!(events(&adapter_conn).len(), 2);
    }

    #[test]
    fn test_publish_listener_reports_client_publish() {
        let engine = SubscriptionEngine::new();
        let (_, adapter_conn, mut session) = adapter_session(&engine);
        session.feed(&direct::encode("uid=feed"));
        session.feed(&direct::encode("addPublishListener"));

        let (client, _) = connected(&engine, "thick");
        engine.message_received(&client, "chat", Arc::new(Payload::new("chat").with_field("m", "hi")));

        assert_eq!(
            events(&adapter_conn),
            vec![r#"onMessageReceived(thick,chat,{"topic":"chat","m":"hi"})"#]
        );
    }

    #[test]
    fn test_adapter_publish_reaches_subscribers() {
        let engine = SubscriptionEngine::new();
        let (_, _, mut session) = adapter_session(&engine);
        let (client, conn) = connected(&engine, "browser");
        engine.subscribe(&client, "AAPL");

        session.feed(&direct::encode(r#"publish(AAPL,{"price":"101.5"})"#));

        assert_eq!(events(&conn), vec![r#"{"price":"101.5","topic":"AAPL"}"#]);
    }

    #[test]
    fn test_adapter_send_targets_one_client() {
        let engine = SubscriptionEngine::new();
        let (_, _, mut session) = adapter_session(&engine);
        let (_, target) = connected(&engine, "target");
        let (other_client, other) = connected(&engine, "other");
        engine.subscribe(&other_client, "AAPL");

        session.feed(&direct::encode(r#"send(target,AAPL,{"topic":"AAPL","snapshot":"1"})"#));
        session.feed(&direct::encode(r#"send(nobody,AAPL,{"topic":"AAPL"})"#));

        assert_eq!(events(&target), vec![r#"{"topic":"AAPL","snapshot":"1"}"#]);
        assert!(other.written().is_empty());
    }

    #[test]
    fn test_registration_before_uid_is_ignored() {
        let engine = SubscriptionEngine::new();
        let (adapters, adapter_conn, mut session) = adapter_session(&engine);
        session.feed(&direct::encode("addSubscriptionListener"));

        let (client, _) = connected(&engine, "browser");
        engine.subscribe(&client, "AAPL");
        assert!(adapters.is_empty());
        assert!(adapter_conn.written().is_empty());
    }

    #[test]
    fn test_failed_write_removes_every_registration() {
        let engine = SubscriptionEngine::new();
        let (adapters, adapter_conn, mut session) = adapter_session(&engine);
        session.feed(&direct::encode("uid=feed"));
        session.feed(&direct::encode("addSubscriptionListener"));
        session.feed(&direct::encode("addPublishListener"));
        assert_eq!(adapters.len(), 1);

        adapter_conn.fail_send();
        let (client, _) = connected(&engine, "browser");
        engine.subscribe(&client, "AAPL");

        assert!(adapter_conn.is_closed());
        assert!(adapters.is_empty());

        // Nothing is registered anymore, so nothing else is attempted.
        engine.subscribe(&client, "MSFT");
        engine.message_received(&client, "chat", Arc::new(Payload::new("chat")));
        assert_eq!(adapter_conn.close_count(), 1);
    }

    #[test]
    fn test_finish_removes_registrations() {
        let engine = SubscriptionEngine::new();
        let (adapters, adapter_conn, mut session) = adapter_session(&engine);
        session.feed(&direct::encode("uid=feed"));
        session.feed(&direct::encode("addSubscriptionListener"));

        session.finish();
        assert!(adapters.is_empty());

        let (client, _) = connected(&engine, "browser");
        engine.subscribe(&client, "AAPL");
        assert!(adapter_conn.written().is_empty());
    }

    #[test]
    fn test_find_or_create_reuses_live_adapter() {
        let engine = SubscriptionEngine::new();
        let adapters = AdapterRegistry::new(Arc::clone(&engine));
        let first: Arc<dyn Connection> = Arc::new(MemoryConnection::new("a"));
        let second: Arc<dyn Connection> = Arc::new(MemoryConnection::new("b"));

        let a = adapters.find_or_create("feed", &first);
        let b = adapters.find_or_create("feed", &second);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.connection_id().as_str(), "a");

        first.close();
        let c = adapters.find_or_create("feed", &second);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.connection_id().as_str(), "b");
        assert!(!adapters.connection_lost("feed", &ConnectionId::new("a")));
        assert_eq!(adapters.len(), 1);
    }

    #[tokio::test]
    async fn test_run_until_adapter_hangs_up() {
        let engine = SubscriptionEngine::new();
        let (adapters, _, session) = adapter_session(&engine);
        let (mut peer, stream) = tokio::io::duplex(1024);
        let task = tokio::spawn(session.run(stream));

        peer.write_all(&direct::encode("uid=feed")).await.unwrap();
        peer.write_all(&direct::encode("addPublishListener")).await.unwrap();
        for _ in 0..200 {
            if !adapters.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(adapters.len(), 1);

        drop(peer);
        task.await.unwrap();
        assert!(adapters.is_empty());
    }
}
