//! Subscription and publish engine.
//!
//! The engine owns the topic → subscribers index and is the only writer of
//! each client's subscription set, so the two always mirror each other. It
//! also listens to client lifecycle events and purges clients that stay
//! disconnected past the reconnection grace period.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::client::{Client, LifecycleState, DEFAULT_QUEUE_SIZE};
use crate::listener::{
    ConnectionListener, ListenerSet, PublishListener, SubscribeListener, UnsubscribeListener,
};
use crate::payload::Payload;
use crate::registry::{ClientFactory, ClientRegistry, RegistryStats};

/// Default reconnection grace period (7 minutes).
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_millis(420_000);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Registry capacity.
    pub max_clients: usize,
    /// Messages a Comet client queues while disconnected.
    pub comet_queue_size: usize,
    /// How long a client that lost its connection keeps its subscriptions.
    pub reconnect_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            comet_queue_size: DEFAULT_QUEUE_SIZE,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Topics with at least one subscriber.
    pub topic_count: usize,
    /// Sum of subscribers over all topics.
    pub total_subscriptions: usize,
    /// Clients waiting out their reconnection grace period.
    pub pending_purges: usize,
}

type Subscribers = HashMap<String, Arc<dyn Client>>;

/// Routes publishes to subscribed clients across all transports.
pub struct SubscriptionEngine {
    topics: DashMap<String, Subscribers>,
    registry: ClientRegistry,
    subscribe_listeners: ListenerSet<dyn SubscribeListener>,
    unsubscribe_listeners: ListenerSet<dyn UnsubscribeListener>,
    publish_listeners: ListenerSet<dyn PublishListener>,
    purges: Mutex<HashMap<String, JoinHandle<()>>>,
    config: EngineConfig,
    me: Weak<SubscriptionEngine>,
}

impl SubscriptionEngine {
    /// Create an engine with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// Create an engine with custom configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Arc<Self> {
        info!(
            max_clients = config.max_clients,
            comet_queue_size = config.comet_queue_size,
            grace_ms = config.reconnect_grace.as_millis() as u64,
            "Creating subscription engine"
        );
        Arc::new_cyclic(|me: &Weak<Self>| {
            let listener: Weak<dyn ConnectionListener> = me.clone();
            let factory = ClientFactory::new(listener, config.comet_queue_size);
            Self {
                topics: DashMap::new(),
                registry: ClientRegistry::new(config.max_clients, factory),
                subscribe_listeners: ListenerSet::new(),
                unsubscribe_listeners: ListenerSet::new(),
                publish_listeners: ListenerSet::new(),
                purges: Mutex::new(HashMap::new()),
                config,
                me: me.clone(),
            }
        })
    }

    /// The client registry.
    #[must_use]
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe `client` to `topic`, then run the subscribe listeners.
    ///
    /// Listeners run on the calling thread and finish before this returns.
    pub fn subscribe(&self, client: &Arc<dyn Client>, topic: &str) {
        if client.state() == LifecycleState::Destroyed {
            debug!(client = %client.uid(), topic = %topic, "Ignoring subscribe from destroyed client");
            return;
        }

        let accepted = {
            // Hold the topic entry while updating the client so a concurrent
            // publish sees both sides or neither.
            let mut subscribers = self.topics.entry(topic.to_string()).or_default();
            subscribers.insert(client.uid().to_string(), Arc::clone(client));
            if client.add_subscription(topic) || client.state() != LifecycleState::Destroyed {
                true
            } else {
                // Destroyed since the check above; its purge has already run.
                subscribers.remove(client.uid());
                false
            }
        };
        if !accepted {
            self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
            debug!(client = %client.uid(), topic = %topic, "Ignoring subscribe from destroyed client");
            return;
        }
        debug!(client = %client.uid(), topic = %topic, "Subscribed");

        for listener in self.subscribe_listeners.snapshot() {
            listener.on_subscribe(topic, client);
        }
    }

    /// Subscribe `client` to each topic in order.
    pub fn subscribe_all<S: AsRef<str>>(&self, client: &Arc<dyn Client>, topics: &[S]) {
        for topic in topics {
            self.subscribe(client, topic.as_ref());
        }
    }

    /// Unsubscribe `client` from `topic`, then run the unsubscribe listeners.
    ///
    /// Returns whether the client was subscribed.
    pub fn unsubscribe(&self, client: &Arc<dyn Client>, topic: &str) -> bool {
        if !self.detach(client, topic) {
            return false;
        }
        debug!(client = %client.uid(), topic = %topic, "Unsubscribed");

        for listener in self.unsubscribe_listeners.snapshot() {
            listener.on_unsubscribe(topic, client);
        }
        true
    }

    /// Unsubscribe `client` from each topic in order.
    pub fn unsubscribe_all<S: AsRef<str>>(&self, client: &Arc<dyn Client>, topics: &[S]) {
        for topic in topics {
            self.unsubscribe(client, topic.as_ref());
        }
    }

    /// Remove both sides of a subscription without notifying anyone.
    fn detach(&self, client: &Arc<dyn Client>, topic: &str) -> bool {
        let removed = match self.topics.get_mut(topic) {
            Some(mut subscribers) => {
                let removed = subscribers.remove(client.uid()).is_some();
                client.remove_subscription(topic);
                removed
            }
            None => {
                client.remove_subscription(topic);
                false
            }
        };
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Send `payload` to every current subscriber of `topic`.
    ///
    /// Each subscriber is sent to independently; one failing client does not
    /// affect the rest. Returns the number of subscribers sent to.
    pub fn publish(&self, topic: &str, payload: Arc<Payload>) -> usize {
        let subscribers: Vec<Arc<dyn Client>> = match self.topics.get(topic) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => {
                trace!(topic = %topic, "Publish to topic without subscribers");
                return 0;
            }
        };

        for client in &subscribers {
            client.send(topic, &payload);
        }

        trace!(topic = %topic, recipients = subscribers.len(), "Published");
        subscribers.len()
    }

    /// Hand a payload published by `client` to the publish listeners.
    ///
    /// Nothing is fanned out here; republishing is up to a listener.
    pub fn message_received(&self, client: &Arc<dyn Client>, topic: &str, payload: Arc<Payload>) {
        debug!(client = %client.uid(), topic = %topic, "Message received");
        for listener in self.publish_listeners.snapshot() {
            listener.on_publish(client, topic, &payload);
        }
    }

    /// Register a subscribe listener.
    pub fn add_subscribe_listener(&self, listener: Arc<dyn SubscribeListener>) {
        self.subscribe_listeners.add(listener);
    }

    /// Remove a subscribe listener.
    pub fn remove_subscribe_listener(&self, listener: &Arc<dyn SubscribeListener>) -> bool {
        self.subscribe_listeners.remove(listener)
    }

    /// Register an unsubscribe listener.
    pub fn add_unsubscribe_listener(&self, listener: Arc<dyn UnsubscribeListener>) {
        self.unsubscribe_listeners.add(listener);
    }

    /// Remove an unsubscribe listener.
    pub fn remove_unsubscribe_listener(&self, listener: &Arc<dyn UnsubscribeListener>) -> bool {
        self.unsubscribe_listeners.remove(listener)
    }

    /// Register a publish listener.
    pub fn add_publish_listener(&self, listener: Arc<dyn PublishListener>) {
        self.publish_listeners.add(listener);
    }

    /// Remove a publish listener.
    pub fn remove_publish_listener(&self, listener: &Arc<dyn PublishListener>) -> bool {
        self.publish_listeners.remove(listener)
    }

    /// Current subscribers of `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<dyn Client>> {
        self.topics
            .get(topic)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, |s| s.len())
    }

    /// Topics with at least one subscriber.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            topic_count: self.topics.len(),
            total_subscriptions: self.topics.iter().map(|e| e.len()).sum(),
            pending_purges: self.purges.lock().len(),
        }
    }

    /// Registry statistics.
    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Cancel pending purges and disconnect every client.
    pub fn shutdown(&self) {
        let pending: Vec<_> = self.purges.lock().drain().collect();
        for (_, handle) in pending {
            handle.abort();
        }

        let clients = self.registry.clients();
        info!(clients = clients.len(), "Shutting down subscription engine");
        for client in clients {
            client.disconnect();
            // Clients that were already disconnected never fire again.
            self.purge(&client);
        }
    }

    /// Remove every trace of a client that is not connected.
    ///
    /// The client is destroyed first, under its own lock, so nothing can
    /// reconnect it or add a subscription once its topics are taken.
    fn purge(&self, client: &Arc<dyn Client>) {
        let Some(topics) = client.destroy() else {
            return;
        };
        for topic in &topics {
            self.detach(client, topic);
        }
        self.registry.remove(client);
        for topic in &topics {
            for listener in self.unsubscribe_listeners.snapshot() {
                listener.on_unsubscribe(topic, client);
            }
        }

        info!(client = %client.uid(), topics = topics.len(), "Client subscriptions removed");
    }

    fn cancel_purge(&self, uid: &str) {
        if let Some(handle) = self.purges.lock().remove(uid) {
            handle.abort();
            debug!(client = %uid, "Cancelled pending purge");
        }
    }

    fn schedule_purge(&self, client: &Arc<dyn Client>) {
        let grace = self.config.reconnect_grace;
        let runtime = match Handle::try_current() {
            Ok(runtime) if !grace.is_zero() => runtime,
            _ => {
                self.purge(client);
                return;
            }
        };

        let mut purges = self.purges.lock();
        if purges.contains_key(client.uid()) {
            return;
        }

        let engine = self.me.clone();
        let target = Arc::clone(client);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            engine.purges.lock().remove(target.uid());
            debug!(client = %target.uid(), "Reconnection grace expired");
            engine.purge(&target);
        });
        purges.insert(client.uid().to_string(), handle);
        debug!(client = %client.uid(), grace_ms = grace.as_millis() as u64, "Scheduled purge");
    }
}

impl ConnectionListener for SubscriptionEngine {
    fn client_connected(&self, client: &Arc<dyn Client>) {
        self.cancel_purge(client.uid());
    }

    fn client_lost_connection(&self, client: &Arc<dyn Client>) {
        self.schedule_purge(client);
    }

    fn client_disconnected(&self, client: &Arc<dyn Client>) {
        self.cancel_purge(client.uid());
        self.purge(client);
    }
}

impl Drop for SubscriptionEngine {
    fn drop(&mut self) {
        for (_, handle) in self.purges.get_mut().drain() {
            handle.abort();
        }
    }
}
