//! Bounded client registry.
//!
//! Holds at most `capacity` clients. Inserting beyond capacity evicts the
//! oldest-inserted client (FIFO, not LRU) and disconnects it.

use parking_lot::Mutex;
use pushwire_transport::{Request, TransportKind};
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use crate::client::{
    Client, ClientError, CometClient, DirectClient, LifecycleState, WebSocketClient,
};
use crate::listener::{same, ConnectionListener};

/// A map that forgets its oldest entry once full.
///
/// Order is insertion order; overwriting an existing key keeps its place.
#[derive(Debug)]
pub struct CircularFifoMap<K, V> {
    entries: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
    next: u64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> CircularFifoMap<K, V> {
    /// Create a map holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next: 0,
            capacity: capacity.max(1),
        }
    }

    /// Insert or overwrite. Returns the evicted entry, if one had to go.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.1 = value;
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.pop_oldest()
        } else {
            None
        };

        let seq = self.next;
        self.next += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(key, (seq, value));
        evicted
    }

    /// Look up a value.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Remove an entry.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    fn pop_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let (_, value) = self.entries.remove(&key)?;
        Some((key, value))
    }

    /// Values from oldest to newest.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.order
            .values()
            .filter_map(|k| self.entries.get(k).map(|(_, v)| v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Builds clients for a transport.
#[derive(Clone)]
pub struct ClientFactory {
    listener: Weak<dyn ConnectionListener>,
    comet_queue_size: usize,
}

impl ClientFactory {
    /// Create a factory whose clients report to `listener`.
    #[must_use]
    pub fn new(listener: Weak<dyn ConnectionListener>, comet_queue_size: usize) -> Self {
        Self {
            listener,
            comet_queue_size,
        }
    }

    /// Create a client for `uid` speaking `kind`.
    #[must_use]
    pub fn create(&self, uid: &str, kind: TransportKind) -> Arc<dyn Client> {
        let listener = self.listener.clone();
        match kind {
            TransportKind::Comet => {
                CometClient::with_queue_size(uid, listener, self.comet_queue_size)
            }
            TransportKind::Direct => DirectClient::new(uid, listener),
            TransportKind::WebSocket => WebSocketClient::new(uid, listener),
        }
    }
}

/// Counters for operational monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Maximum number of clients.
    pub capacity: usize,
    /// Registered clients.
    pub total_clients: usize,
    /// Registered clients currently connected.
    pub connected_clients: usize,
    /// Clients evicted to make room since creation.
    pub evictions: u64,
}

/// Maps client identifiers to clients, bounded by capacity.
pub struct ClientRegistry {
    clients: Mutex<CircularFifoMap<String, Arc<dyn Client>>>,
    factory: ClientFactory,
    evictions: AtomicU64,
}

impl ClientRegistry {
    /// Create a registry holding at most `capacity` clients.
    #[must_use]
    pub fn new(capacity: usize, factory: ClientFactory) -> Self {
        Self {
            clients: Mutex::new(CircularFifoMap::new(capacity)),
            factory,
            evictions: AtomicU64::new(0),
        }
    }

    /// Find the request's client, creating it if needed, and bind the
    /// request's connection to it.
    ///
    /// Calls are serialized, so one uid never yields two clients.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::MissingUid`] if the request has no identifier
    /// and [`ClientError::UnknownTransport`] if a new client is needed but
    /// the transport is unknown.
    pub fn find_or_create(&self, request: &Request) -> Result<Arc<dyn Client>, ClientError> {
        let uid = request.uid().ok_or(ClientError::MissingUid)?;

        let (client, evicted) = {
            let mut clients = self.clients.lock();
            match clients.get(uid) {
                Some(existing) if existing.state() != LifecycleState::Destroyed => {
                    (Arc::clone(existing), None)
                }
                _ => {
                    let kind = request
                        .transport()
                        .ok_or_else(|| ClientError::UnknownTransport(uid.to_string()))?;
                    let client = self.factory.create(uid, kind);
                    debug!(client = %uid, transport = %kind, "Created client");
                    let evicted = clients.insert(uid.to_string(), Arc::clone(&client));
                    (client, evicted)
                }
            }
        };

        if let Some((evicted_uid, evicted)) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            error!(
                client = %evicted_uid,
                capacity = self.capacity(),
                "Max client limit reached, evicting oldest client"
            );
            evicted.disconnect();
        }

        if let Some(connection) = request.connection() {
            client.set_connection(Arc::clone(connection));
        }

        Ok(client)
    }

    /// Look up a client without creating one.
    #[must_use]
    pub fn find(&self, uid: &str) -> Option<Arc<dyn Client>> {
        let found = self.clients.lock().get(uid).cloned();
        if found.is_none() {
            warn!(client = %uid, "Client not found");
        }
        found
    }

    /// Remove `client`'s entry without closing anything.
    ///
    /// Only this exact client is removed; a newer client registered under
    /// the same uid stays.
    pub fn remove(&self, client: &Arc<dyn Client>) -> bool {
        let mut clients = self.clients.lock();
        match clients.get(client.uid()) {
            Some(current) if same(current, client) => {
                clients.remove(client.uid());
                debug!(client = %client.uid(), "Removed client");
                true
            }
            _ => false,
        }
    }

    /// Every registered client, oldest first.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<dyn Client>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Maximum number of clients.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.clients.lock().capacity()
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    /// Whether no clients are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let clients = self.clients();
        RegistryStats {
            capacity: self.capacity(),
            total_clients: clients.len(),
            connected_clients: clients.iter().filter(|c| c.is_connected()).count(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{weak, RecordingListener};
    use pushwire_transport::{Connection, MemoryConnection};

    fn registry(capacity: usize) -> (ClientRegistry, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let factory = ClientFactory::new(weak(&listener), 10);
        (ClientRegistry::new(capacity, factory), listener)
    }

    #[test]
    fn test_fifo_map_evicts_oldest_inserted() {
        let mut map = CircularFifoMap::new(2);
        assert!(map.insert("a", 1).is_none());
        assert!(map.insert("b", 2).is_none());
        assert!(map.insert("a", 10).is_none());
        assert_eq!(map.insert("c", 3), Some(("a", 10)));
        assert_eq!(map.values().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_fifo_map_remove_frees_slot() {
        let mut map = CircularFifoMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.remove("a"), Some(1));
        assert!(map.insert("c", 3).is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_find_or_create_reuses_client() {
        let (registry, _) = registry(10);
        let a = registry
            .find_or_create(&Request::new("u1", TransportKind::Direct))
            .unwrap();
        let b = registry.find_or_create(&Request::untyped("u1")).unwrap();

        assert!(same(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.transport(), TransportKind::Direct);
    }

    #[test]
    fn test_find_or_create_errors() {
        let (registry, _) = registry(10);
        assert_eq!(
            registry.find_or_create(&Request::default()).unwrap_err(),
            ClientError::MissingUid
        );
        assert_eq!(
            registry.find_or_create(&Request::untyped("u1")).unwrap_err(),
            ClientError::UnknownTransport("u1".into())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_or_create_binds_connection() {
        let (registry, _) = registry(10);
        let conn: Arc<dyn Connection> = Arc::new(MemoryConnection::new("c1"));
        let client = registry
            .find_or_create(&Request::new("u1", TransportKind::Comet).with_connection(conn))
            .unwrap();
        assert_eq!(client.connection_id().unwrap().as_str(), "c1");
    }

    #[test]
    fn test_eviction_disconnects_first_client() {
        let (registry, listener) = registry(3);
        let conn = Arc::new(MemoryConnection::new("c0"));
        let first = registry
            .find_or_create(
                &Request::new("u0", TransportKind::WebSocket).with_connection(conn.clone()),
            )
            .unwrap();
        for i in 1..=3 {
            registry
                .find_or_create(&Request::new(format!("u{i}"), TransportKind::Direct))
                .unwrap();
        }

        assert_eq!(registry.len(), 3);
        assert!(registry.find("u0").is_none());
        assert!(registry.find("u1").is_some());
        assert_eq!(first.state(), LifecycleState::Disconnected);
        assert!(conn.is_closed());
        assert_eq!(
            *listener.events.lock(),
            vec![("disconnected", "u0".to_string())]
        );
        assert_eq!(registry.stats().evictions, 1);
    }

    #[test]
    fn test_remove_only_same_instance() {
        let (registry, _) = registry(10);
        let old = registry
            .find_or_create(&Request::new("u1", TransportKind::Direct))
            .unwrap();
        assert!(registry.remove(&old));

        let new = registry
            .find_or_create(&Request::new("u1", TransportKind::Direct))
            .unwrap();
        assert!(!registry.remove(&old));
        assert!(registry.find("u1").is_some());
        assert!(registry.remove(&new));
    }

    #[test]
    fn test_destroyed_entry_is_replaced() {
        let (registry, _) = registry(10);
        let old = registry
            .find_or_create(&Request::new("u1", TransportKind::Direct))
            .unwrap();
        assert!(old.destroy().is_some());

        let new = registry
            .find_or_create(&Request::new("u1", TransportKind::Direct))
            .unwrap();
        assert!(!same(&old, &new));
        assert_eq!(new.state(), LifecycleState::Unbound);
        assert_eq!(new.transport(), TransportKind::Direct);
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove(&old));
    }

    #[test]
    fn test_stats() {
        let (registry, _) = registry(5);
        let a = registry
            .find_or_create(&Request::new("a", TransportKind::Direct))
            .unwrap();
        registry
            .find_or_create(&Request::new("b", TransportKind::Comet))
            .unwrap();
        a.on_connect();

        assert_eq!(
            registry.stats(),
            RegistryStats {
                capacity: 5,
                total_clients: 2,
                connected_clients: 1,
                evictions: 0,
            }
        );
    }
}
