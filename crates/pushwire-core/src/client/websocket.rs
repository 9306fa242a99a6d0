//! WebSocket client using legacy `0x00 ... 0xFF` framing.

use pushwire_transport::{Connection, ConnectionId, TransportKind};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{Client, ClientCore, LifecycleState};
use crate::listener::ConnectionListener;
use crate::payload::Payload;

/// A browser client on a framed socket.
pub struct WebSocketClient {
    core: ClientCore<()>,
}

impl WebSocketClient {
    /// Create a new client.
    #[must_use]
    pub fn new(uid: impl Into<String>, listener: Weak<dyn ConnectionListener>) -> Arc<Self> {
        let uid = uid.into();
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn Client> = me.clone();
            Self {
                core: ClientCore::new(uid, TransportKind::WebSocket, listener, me, ()),
            }
        })
    }
}

impl Client for WebSocketClient {
    fn uid(&self) -> &str {
        self.core.uid()
    }

    fn transport(&self) -> TransportKind {
        self.core.kind()
    }

    fn state(&self) -> LifecycleState {
        self.core.state()
    }

    fn subscriptions(&self) -> Vec<String> {
        self.core.subscriptions()
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.core.is_subscribed(topic)
    }

    fn add_subscription(&self, topic: &str) -> bool {
        self.core.add_subscription(topic)
    }

    fn remove_subscription(&self, topic: &str) -> bool {
        self.core.remove_subscription(topic)
    }

    fn set_connection(&self, connection: Arc<dyn Connection>) {
        self.core.set_connection(connection);
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.core.connection_id()
    }

    fn on_connect(&self) {
        self.core.on_connect();
    }

    fn send(&self, topic: &str, payload: &Arc<Payload>) {
        let uid = self.core.uid();
        let notice = {
            let mut inner = self.core.lock();
            if !inner.writable() {
                debug!(client = %uid, topic = %topic, "Not connected, dropping message");
                return;
            }
            let bytes = payload.stamped().to_websocket_bytes();
            inner.write(uid, bytes)
        };
        self.core.notify(notice);
    }

    fn disconnect(&self) {
        self.core.disconnect();
    }

    fn lost_connection(&self) {
        self.core.lost_connection();
    }

    fn queued_messages(&self) -> String {
        warn!(client = %self.core.uid(), "queued_messages called on a websocket client");
        String::new()
    }

    fn destroy(&self) -> Option<Vec<String>> {
        self.core.destroy()
    }
}
