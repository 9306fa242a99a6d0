//! Metrics collection and export for pushwire.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use pushwire_core::{EngineStats, RegistryStats};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "pushwire_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "pushwire_connections_active";
    pub const MESSAGES_TOTAL: &str = "pushwire_messages_total";
    pub const MESSAGES_BYTES: &str = "pushwire_messages_bytes";
    pub const PUBLISHES_TOTAL: &str = "pushwire_publishes_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "pushwire_subscriptions_total";
    pub const CLIENTS: &str = "pushwire_clients";
    pub const CLIENTS_CONNECTED: &str = "pushwire_clients_connected";
    pub const CLIENT_CAPACITY: &str = "pushwire_client_capacity";
    pub const TOPICS_ACTIVE: &str = "pushwire_topics_active";
    pub const EVICTIONS_TOTAL: &str = "pushwire_evictions_total";
    pub const PUBLISH_RECIPIENTS: &str = "pushwire_publish_recipients";
    pub const ERRORS_TOTAL: &str = "pushwire_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of socket and stream connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open socket and stream connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Total number of publishes");
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total number of subscriptions");
    metrics::describe_gauge!(names::CLIENTS, "Registered clients");
    metrics::describe_gauge!(names::CLIENTS_CONNECTED, "Registered clients currently connected");
    metrics::describe_gauge!(names::CLIENT_CAPACITY, "Client registry capacity");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Topics with at least one subscriber");
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Clients evicted because the registry was full"
    );
    metrics::describe_histogram!(
        names::PUBLISH_RECIPIENTS,
        "Subscribers reached per server publish"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport).increment(1.0);
}

/// Record a closed connection.
pub fn record_disconnection(transport: &'static str) {
    gauge!(names::CONNECTIONS_ACTIVE, "transport" => transport).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a publish from a client.
pub fn record_client_publish() {
    counter!(names::PUBLISHES_TOTAL, "origin" => "client").increment(1);
}

/// Record a server fan-out and how many subscribers it reached.
pub fn record_fanout(recipients: usize) {
    counter!(names::PUBLISHES_TOTAL, "origin" => "server").increment(1);
    histogram!(names::PUBLISH_RECIPIENTS).record(recipients as f64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish registry and engine counters as gauges.
pub fn record_stats(registry: RegistryStats, engine: EngineStats) {
    gauge!(names::CLIENTS).set(registry.total_clients as f64);
    gauge!(names::CLIENTS_CONNECTED).set(registry.connected_clients as f64);
    gauge!(names::CLIENT_CAPACITY).set(registry.capacity as f64);
    gauge!(names::TOPICS_ACTIVE).set(engine.topic_count as f64);
    counter!(names::EVICTIONS_TOTAL).absolute(registry.evictions);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard {
    transport: &'static str,
}

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        record_connection(transport);
        Self { transport }
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection(self.transport);
    }
}
