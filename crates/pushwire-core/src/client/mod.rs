//! Clients and their connection lifecycle.
//!
//! A client is one subscriber identity (`uid`) with a subscription set and
//! at most one live [`Connection`]. The three transports differ only in how
//! [`Client::send`] frames and buffers a payload:
//!
//! - [`CometClient`] queues while it has no response stream
//! - [`DirectClient`] writes `@@@@`-delimited text or drops
//! - [`WebSocketClient`] writes `0x00 ... 0xFF` frames or drops
//!
//! ```text
//! Unbound ──on_connect──▶ Connected ──write failure──▶ LostConnection
//!    │                        │                              │
//!    └────────disconnect──────┴──────────disconnect──────────┴──▶ Disconnected
//!
//! any state ──destroy──▶ Destroyed
//! ```
//!
//! Every mutation takes the client's own lock; listener callbacks run after
//! it is released.

mod comet;
mod direct;
mod websocket;

pub use comet::{CometClient, DEFAULT_QUEUE_SIZE};
pub use direct::DirectClient;
pub use websocket::WebSocketClient;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use pushwire_transport::{Connection, ConnectionId, TransportError, TransportKind};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::listener::ConnectionListener;
use crate::payload::Payload;

/// Client creation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The request carried no client identifier.
    #[error("Request has no client identifier")]
    MissingUid,

    /// The request's transport could not be mapped to a client type.
    #[error("Unknown transport for client {0}")]
    UnknownTransport(String),
}

/// Where a client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, never connected.
    Unbound,
    /// Connection attached and `on_connect` fired.
    Connected,
    /// Connection dropped unexpectedly; the client may reconnect.
    LostConnection,
    /// Deliberately closed.
    Disconnected,
    /// Removed from the registry; all resources released.
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unbound => "unbound",
            LifecycleState::Connected => "connected",
            LifecycleState::LostConnection => "lost_connection",
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// The capability every transport variant provides.
///
/// The engine and registry only ever see `Arc<dyn Client>`.
pub trait Client: Send + Sync {
    /// Unique client identifier.
    fn uid(&self) -> &str;

    /// Transport this client speaks.
    fn transport(&self) -> TransportKind;

    /// Current lifecycle state.
    fn state(&self) -> LifecycleState;

    /// Whether the client is connected.
    fn is_connected(&self) -> bool {
        self.state() == LifecycleState::Connected
    }

    /// Topics this client is subscribed to.
    fn subscriptions(&self) -> Vec<String>;

    /// Whether the client is subscribed to `topic`.
    fn is_subscribed(&self, topic: &str) -> bool;

    /// Record a subscription. Only the engine calls this.
    fn add_subscription(&self, topic: &str) -> bool;

    /// Forget a subscription. Only the engine calls this.
    fn remove_subscription(&self, topic: &str) -> bool;

    /// Bind the connection to write through, superseding any previous one.
    fn set_connection(&self, connection: Arc<dyn Connection>);

    /// Identifier of the bound connection.
    fn connection_id(&self) -> Option<ConnectionId>;

    /// Hand the client the token that stops its inbound reader.
    ///
    /// Only clients that own a server-side reader keep it; the default
    /// ignores the token.
    fn set_reader(&self, _reader: CancellationToken) {}

    /// Mark connected and notify the listener.
    fn on_connect(&self);

    /// Deliver `payload`. Never fails; a write failure moves the client to
    /// [`LifecycleState::LostConnection`].
    fn send(&self, topic: &str, payload: &Arc<Payload>);

    /// Deliberate teardown.
    fn disconnect(&self);

    /// Involuntary teardown. Fires at most once per connection.
    fn lost_connection(&self);

    /// Drain queued messages as a `[a,b,...]` batch.
    fn queued_messages(&self) -> String;

    /// Release everything unless the client is connected.
    ///
    /// Returns the subscriptions the client held, or `None` if it is
    /// connected or already destroyed. Once this succeeds no subscription
    /// can be added.
    fn destroy(&self) -> Option<Vec<String>>;
}

impl fmt::Debug for dyn Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("uid", &self.uid())
            .field("transport", &self.transport())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for dyn Client {
    fn eq(&self, other: &Self) -> bool {
        self.uid() == other.uid()
    }
}

impl Eq for dyn Client {}

/// Transport-specific state that reacts to teardown.
pub(crate) trait ClientExtra: Send + 'static {
    /// The connection was torn down (lost or disconnected).
    fn on_teardown(&mut self) {}

    /// The client is being destroyed.
    fn on_destroy(&mut self) {
        self.on_teardown();
    }
}

impl ClientExtra for () {}

/// A lifecycle transition to report once the lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notice {
    Connected,
    LostConnection,
    Disconnected,
}

/// How a failed write is reported. Every kind loses the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteFailure {
    /// The peer went away; an expected lifecycle event.
    Closed,
    /// The peer is not draining its buffer.
    Backpressure,
    /// Anything else.
    Fault,
}

impl WriteFailure {
    pub(crate) fn classify(e: &TransportError) -> Self {
        match e {
            e if e.is_closed() => WriteFailure::Closed,
            TransportError::Backpressure => WriteFailure::Backpressure,
            _ => WriteFailure::Fault,
        }
    }
}

/// Lock-guarded client state.
pub(crate) struct Inner<T> {
    pub(crate) state: LifecycleState,
    pub(crate) connection: Option<Arc<dyn Connection>>,
    pub(crate) subscriptions: HashSet<String>,
    pub(crate) extra: T,
}

impl<T: ClientExtra> Inner<T> {
    fn connect(&mut self) -> Option<Notice> {
        if self.state == LifecycleState::Destroyed {
            return None;
        }
        self.state = LifecycleState::Connected;
        Some(Notice::Connected)
    }

    pub(crate) fn lose(&mut self) -> Option<Notice> {
        match self.state {
            LifecycleState::Unbound | LifecycleState::Connected => {
                self.teardown();
                self.state = LifecycleState::LostConnection;
                Some(Notice::LostConnection)
            }
            _ => None,
        }
    }

    fn end(&mut self) -> Option<Notice> {
        match self.state {
            LifecycleState::Disconnected | LifecycleState::Destroyed => None,
            _ => {
                self.teardown();
                self.state = LifecycleState::Disconnected;
                Some(Notice::Disconnected)
            }
        }
    }

    fn destroy(&mut self) -> Option<Vec<String>> {
        if matches!(
            self.state,
            LifecycleState::Connected | LifecycleState::Destroyed
        ) {
            return None;
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.extra.on_destroy();
        self.state = LifecycleState::Destroyed;
        Some(self.subscriptions.drain().collect())
    }

    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.extra.on_teardown();
    }

    /// Write through the bound connection; a failure loses the connection.
    pub(crate) fn write(&mut self, uid: &str, data: Bytes) -> Option<Notice> {
        let connection = self.connection.as_ref()?;
        let e = connection.write(data).err()?;
        match WriteFailure::classify(&e) {
            WriteFailure::Closed => {
                info!(client = %uid, "Connection closed during write");
            }
            WriteFailure::Backpressure => {
                warn!(client = %uid, "Outbound buffer full, dropping connection");
            }
            WriteFailure::Fault => error!(client = %uid, error = %e, "Write failed"),
        }
        self.lose()
    }

    /// Whether `send` may write right now.
    pub(crate) fn writable(&self) -> bool {
        self.state == LifecycleState::Connected && self.connection.is_some()
    }
}

/// State and behaviour shared by all client variants.
pub(crate) struct ClientCore<T> {
    uid: String,
    kind: TransportKind,
    listener: Weak<dyn ConnectionListener>,
    me: Weak<dyn Client>,
    inner: Mutex<Inner<T>>,
}

impl<T: ClientExtra> ClientCore<T> {
    pub(crate) fn new(
        uid: String,
        kind: TransportKind,
        listener: Weak<dyn ConnectionListener>,
        me: Weak<dyn Client>,
        extra: T,
    ) -> Self {
        Self {
            uid,
            kind,
            listener,
            me,
            inner: Mutex::new(Inner {
                state: LifecycleState::Unbound,
                connection: None,
                subscriptions: HashSet::new(),
                extra,
            }),
        }
    }

    pub(crate) fn uid(&self) -> &str {
        &self.uid
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock()
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.iter().cloned().collect()
    }

    pub(crate) fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().subscriptions.contains(topic)
    }

    pub(crate) fn add_subscription(&self, topic: &str) -> bool {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Destroyed {
            return false;
        }
        inner.subscriptions.insert(topic.to_string())
    }

    pub(crate) fn remove_subscription(&self, topic: &str) -> bool {
        self.lock().subscriptions.remove(topic)
    }

    pub(crate) fn set_connection(&self, connection: Arc<dyn Connection>) {
        let mut inner = self.lock();
        if inner.state == LifecycleState::Destroyed {
            warn!(client = %self.uid, "Connection offered to destroyed client, closing");
            connection.close();
            return;
        }
        if let Some(previous) = inner.connection.replace(Arc::clone(&connection)) {
            if previous.id() != connection.id() {
                debug!(
                    client = %self.uid,
                    previous = %previous.id(),
                    current = %connection.id(),
                    "Connection superseded"
                );
            }
        }
    }

    pub(crate) fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().connection.as_ref().map(|c| c.id().clone())
    }

    pub(crate) fn on_connect(&self) {
        let notice = self.lock().connect();
        self.notify(notice);
    }

    pub(crate) fn disconnect(&self) {
        let notice = self.lock().end();
        self.notify(notice);
    }

    pub(crate) fn lost_connection(&self) {
        let notice = self.lock().lose();
        self.notify(notice);
    }

    pub(crate) fn destroy(&self) -> Option<Vec<String>> {
        let topics = self.lock().destroy()?;
        debug!(client = %self.uid, "Client destroyed");
        Some(topics)
    }

    /// Report a transition. Must be called without the lock held.
    pub(crate) fn notify(&self, notice: Option<Notice>) {
        let Some(notice) = notice else {
            return;
        };

        match notice {
            Notice::Connected => {
                info!(client = %self.uid, transport = %self.kind, "Client connected");
            }
            Notice::LostConnection => {
                info!(client = %self.uid, transport = %self.kind, "Client lost connection");
            }
            Notice::Disconnected => {
                info!(client = %self.uid, transport = %self.kind, "Client disconnected");
            }
        }

        let (Some(listener), Some(me)) = (self.listener.upgrade(), self.me.upgrade()) else {
            return;
        };
        match notice {
            Notice::Connected => listener.client_connected(&me),
            Notice::LostConnection => listener.client_lost_connection(&me),
            Notice::Disconnected => listener.client_disconnected(&me),
        }
    }
}
