//! Listener traits and the snapshot-iterated listener set.

use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use crate::client::Client;
use crate::payload::Payload;

/// Receives client lifecycle transitions.
///
/// Called after the client's own lock is released, so implementations may
/// call back into the client.
pub trait ConnectionListener: Send + Sync {
    /// The client bound a connection and is now connected.
    fn client_connected(&self, client: &Arc<dyn Client>);

    /// The client's connection failed or overflowed.
    fn client_lost_connection(&self, client: &Arc<dyn Client>);

    /// The client was deliberately disconnected.
    fn client_disconnected(&self, client: &Arc<dyn Client>);
}

struct Detached;

impl ConnectionListener for Detached {
    fn client_connected(&self, _client: &Arc<dyn Client>) {}
    fn client_lost_connection(&self, _client: &Arc<dyn Client>) {}
    fn client_disconnected(&self, _client: &Arc<dyn Client>) {}
}

/// A listener handle that never upgrades, for clients nobody observes.
#[must_use]
pub fn detached() -> Weak<dyn ConnectionListener> {
    Weak::<Detached>::new()
}

/// Called after a client is subscribed to a topic.
///
/// Runs before `subscribe` returns; sending an initial snapshot to the
/// client from here is fine.
pub trait SubscribeListener: Send + Sync {
    /// `client` is now subscribed to `topic`.
    fn on_subscribe(&self, topic: &str, client: &Arc<dyn Client>);
}

/// Called after a client is unsubscribed from a topic.
pub trait UnsubscribeListener: Send + Sync {
    /// `client` no longer receives publishes on `topic`.
    fn on_unsubscribe(&self, topic: &str, client: &Arc<dyn Client>);
}

/// Called when a client publishes a payload over its inbound stream.
///
/// Nothing is fanned out automatically; a listener decides whether to
/// republish, transform or drop the payload.
pub trait PublishListener: Send + Sync {
    /// `client` published `payload` on `topic`.
    fn on_publish(&self, client: &Arc<dyn Client>, topic: &str, payload: &Arc<Payload>);
}

impl<F> SubscribeListener for F
where
    F: Fn(&str, &Arc<dyn Client>) + Send + Sync,
{
    fn on_subscribe(&self, topic: &str, client: &Arc<dyn Client>) {
        self(topic, client);
    }
}

impl<F> UnsubscribeListener for F
where
    F: Fn(&str, &Arc<dyn Client>) + Send + Sync,
{
    fn on_unsubscribe(&self, topic: &str, client: &Arc<dyn Client>) {
        self(topic, client);
    }
}

impl<F> PublishListener for F
where
    F: Fn(&Arc<dyn Client>, &str, &Arc<Payload>) + Send + Sync,
{
    fn on_publish(&self, client: &Arc<dyn Client>, topic: &str, payload: &Arc<Payload>) {
        self(client, topic, payload);
    }
}

/// Ordered set of listeners.
///
/// Iteration works on a snapshot, so listeners may be added or removed
/// while a notification is in progress.
pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Vec<Arc<L>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Append a listener. Adding the same handle twice is a no-op.
    pub fn add(&self, listener: Arc<L>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| same(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a listener by handle. Returns whether it was present.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        listeners.len() != before
    }

    /// Current listeners in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners.read().clone()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity comparison that ignores trait-object metadata.
pub(crate) fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
