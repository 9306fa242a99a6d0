//! HTTP handlers for the pushwire server.
//!
//! Serves the Comet endpoints under the configured path prefix and a health
//! check. The socket listeners are started alongside from [`run_server`].

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::sockets;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use futures_util::StreamExt;
use pushwire_core::{
    AdapterRegistry, Client, ClientError, Payload, PublishListener, SubscribeListener,
    SubscriptionEngine,
};
use pushwire_protocol::ProtocolError;
use pushwire_transport::{
    ChannelConnection, Connection, ConnectionId, Outbound, Request, TransportKind,
};
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First bytes of every Comet response stream.
const RESPONSE_PREAMBLE: &str =
    "<html><head><script>x=window.parent.x;</script></head><body><script>x(\"response OK\");</script>";

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The subscription engine.
    pub engine: Arc<SubscriptionEngine>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state and wire the engine listeners.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = SubscriptionEngine::with_config(config.engine_config());

        let on_subscribe: Arc<dyn SubscribeListener> =
            Arc::new(|topic: &str, client: &Arc<dyn Client>| {
                debug!(client = %client.uid(), topic = %topic, "Subscribed");
                metrics::record_subscription();
            });
        engine.add_subscribe_listener(on_subscribe);

        let relay = config.payload.relay;
        let timestamping = config.payload.timestamping;
        let weak: Weak<SubscriptionEngine> = Arc::downgrade(&engine);
        let on_publish: Arc<dyn PublishListener> = Arc::new(
            move |client: &Arc<dyn Client>, topic: &str, payload: &Arc<Payload>| {
                metrics::record_client_publish();
                if !relay {
                    return;
                }
                if let Some(engine) = weak.upgrade() {
                    let recipients = fan_out(&engine, topic, Arc::clone(payload), timestamping);
                    debug!(client = %client.uid(), topic = %topic, recipients, "Relayed publish");
                }
            },
        );
        engine.add_publish_listener(on_publish);

        Self { engine, config }
    }

    /// Publish from the server to every subscriber of `topic`.
    pub fn publish(&self, topic: &str, payload: Payload) -> usize {
        fan_out(
            &self.engine,
            topic,
            Arc::new(payload),
            self.config.payload.timestamping,
        )
    }

    fn comet_client(&self, uid: Option<&str>) -> Result<Arc<dyn Client>, ClientError> {
        let request = Request::new(uid.unwrap_or_default(), TransportKind::Comet);
        self.engine.registry().find_or_create(&request)
    }

    /// Bind a fresh streaming connection to the Comet client `uid` and flush
    /// its queue into it.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing.
    pub fn open_response(
        &self,
        uid: Option<&str>,
    ) -> Result<(Arc<dyn Client>, Arc<ChannelConnection>, Outbound), ClientError> {
        let uid = uid.filter(|u| !u.is_empty()).ok_or(ClientError::MissingUid)?;
        let (connection, outbound) =
            ChannelConnection::new(ConnectionId::generate(), self.config.limits.outbound_buffer);
        if let Err(e) = connection.write(Bytes::from_static(RESPONSE_PREAMBLE.as_bytes())) {
            warn!(client = %uid, error = %e, "Failed to write response preamble");
        }

        let request = Request::new(uid, TransportKind::Comet).with_connection(connection.clone());
        let client = self.engine.registry().find_or_create(&request)?;
        info!(client = %uid, connection = %connection.id(), "Connecting client");
        client.on_connect();
        Ok((client, connection, outbound))
    }

    /// Subscribe the Comet client `uid` to each topic in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing.
    pub fn subscribe(&self, uid: Option<&str>, topics: &[String]) -> Result<(), ClientError> {
        let client = self.comet_client(uid)?;
        self.engine.subscribe_all(&client, topics);
        Ok(())
    }

    /// Unsubscribe the Comet client `uid` from each topic in order.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing.
    pub fn unsubscribe(&self, uid: Option<&str>, topics: &[String]) -> Result<(), ClientError> {
        let client = self.comet_client(uid)?;
        self.engine.unsubscribe_all(&client, topics);
        Ok(())
    }

    /// Hand a payload published by `uid` to the publish listeners.
    ///
    /// The topic comes from the query, falling back to the payload's own
    /// `topic` field; a payload without one gets it added.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing, the payload is not a JSON
    /// object, or no topic is known.
    pub fn client_publish(
        &self,
        uid: Option<&str>,
        topic: Option<&str>,
        payload: &str,
    ) -> Result<(), ApiError> {
        let client = self.comet_client(uid)?;
        let mut payload = Payload::from_json(payload)?;
        let topic = match topic.filter(|t| !t.is_empty()) {
            Some(topic) => topic.to_string(),
            None => payload.topic().to_string(),
        };
        if topic.is_empty() {
            return Err(ApiError::MissingTopic);
        }
        if payload.topic().is_empty() {
            payload.add_field(pushwire_core::payload::TOPIC_FIELD, topic.as_str());
        }

        self.engine.message_received(&client, &topic, Arc::new(payload));
        Ok(())
    }

    /// Queued messages of the Comet client `uid` as one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing.
    pub fn poll(&self, uid: Option<&str>) -> Result<String, ClientError> {
        let client = self.comet_client(uid)?;
        debug!(client = %client.uid(), "Poll request");
        Ok(client.queued_messages())
    }

    /// Disconnect the client `uid`.
    ///
    /// # Errors
    ///
    /// Returns an error if `uid` is missing.
    pub fn disconnect(&self, uid: Option<&str>) -> Result<(), ClientError> {
        let client = self.comet_client(uid)?;
        client.disconnect();
        Ok(())
    }
}

/// Publish `payload` to `topic`, stamping it per send when `timestamping`.
fn fan_out(
    engine: &SubscriptionEngine,
    topic: &str,
    payload: Arc<Payload>,
    timestamping: bool,
) -> usize {
    let payload = if timestamping && !payload.is_timestamping() {
        let mut stamped = (*payload).clone();
        stamped.toggle_timestamping(true);
        Arc::new(stamped)
    } else {
        payload
    };
    let recipients = engine.publish(topic, payload);
    metrics::record_fanout(recipients);
    recipients
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The client could not be found or created.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The published payload could not be decoded.
    #[error("bad payload: {0}")]
    Payload(#[from] ProtocolError),

    /// A publish named no topic.
    #[error("publish without topic")]
    MissingTopic,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error("request");
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

/// Query string of the Comet endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct CometQuery {
    uid: Option<String>,
    topic: Option<String>,
    payload: Option<String>,
}

impl CometQuery {
    fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    /// Comma separated topics, trimmed, empties dropped.
    fn topics(&self) -> Vec<String> {
        self.topic
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let prefix = state.config.comet_prefix().to_string();
    let comet = [
        ("response", get(response_handler)),
        ("poll", get(poll_handler)),
        ("subscribe", get(subscribe_handler)),
        ("unsubscribe", get(unsubscribe_handler)),
        ("publish", get(publish_handler)),
        ("disconnect", get(disconnect_handler)),
        ("closeresponse", get(close_response_handler)),
    ];

    let mut app = Router::new().route("/health", get(health_handler));
    for (name, handler) in comet {
        app = app
            .route(&format!("{prefix}/{name}"), handler.clone())
            .route(&format!("{prefix}/{name}/"), handler);
    }
    app.with_state(state)
}

/// Run the HTTP server and the socket listeners until Ctrl-C.
///
/// # Errors
///
/// Returns an error if a listener fails to bind or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));
    let shutdown = CancellationToken::new();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    tokio::spawn(report_stats(Arc::downgrade(&state.engine), shutdown.clone()));

    let mut tasks = Vec::new();
    if config.transport.direct {
        let addr = config.direct_addr()?;
        tasks.push(
            sockets::spawn_direct(addr, &config, Arc::clone(&state.engine), shutdown.clone())
                .await
                .with_context(|| format!("Failed to bind Direct listener on {addr}"))?,
        );
    }
    if config.transport.websocket {
        let addr = config.websocket_addr()?;
        tasks.push(
            sockets::spawn_websocket(addr, &config, Arc::clone(&state.engine), shutdown.clone())
                .await
                .with_context(|| format!("Failed to bind WebSocket listener on {addr}"))?,
        );
    }
    if config.transport.adapter {
        let addr = config.adapter_addr()?;
        let adapters = AdapterRegistry::new(Arc::clone(&state.engine));
        tasks.push(
            sockets::spawn_adapter(addr, &config, adapters, shutdown.clone())
                .await
                .with_context(|| format!("Failed to bind adapter listener on {addr}"))?,
        );
        info!("Streaming adapter endpoint: {}", addr);
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;

    info!("pushwire listening on {}", addr);
    info!("Comet endpoint: http://{}{}/", addr, config.comet_prefix());

    let app = router(Arc::clone(&state));
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    state.engine.shutdown();

    Ok(())
}

/// Periodically export registry and engine counters.
async fn report_stats(engine: Weak<SubscriptionEngine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(engine) = engine.upgrade() else {
            break;
        };
        metrics::record_stats(engine.registry_stats(), engine.stats());
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.engine.registry_stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": registry.total_clients,
        "connected": registry.connected_clients,
        "capacity": registry.capacity,
        "topics": state.engine.stats().topic_count,
    }))
}

fn html(body: impl Into<Body>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/html"),
            (header::CACHE_CONTROL, "no-store, no-cache"),
            (header::PRAGMA, "no-cache"),
        ],
        body.into(),
    )
        .into_response()
}

/// Loses the client when the HTTP body is dropped while still bound.
struct ResponseGuard {
    client: Arc<dyn Client>,
    connection: ConnectionId,
    _metrics: ConnectionMetricsGuard,
}

impl ResponseGuard {
    fn sent(&self, bytes: usize) {
        metrics::record_message(bytes, "outbound");
    }
}

impl Drop for ResponseGuard {
    fn drop(&mut self) {
        if self.client.connection_id().as_ref() == Some(&self.connection) {
            debug!(client = %self.client.uid(), "Response stream dropped");
            self.client.lost_connection();
        }
    }
}

async fn response_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    let (client, connection, outbound) = state.open_response(query.uid())?;
    let guard = ResponseGuard {
        client,
        connection: connection.id().clone(),
        _metrics: ConnectionMetricsGuard::new(TransportKind::Comet.as_str()),
    };
    let stream = outbound.into_stream().map(move |chunk| {
        if let Ok(bytes) = &chunk {
            guard.sent(bytes.len());
        }
        chunk
    });
    Ok(html(Body::from_stream(stream)))
}

async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    Ok(html(state.poll(query.uid())?))
}

async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    state.subscribe(query.uid(), &query.topics())?;
    Ok(html("<body>subscription OK</body></html>"))
}

async fn unsubscribe_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    state.unsubscribe(query.uid(), &query.topics())?;
    Ok(html("<body>unsubscribe OK</body></html>"))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    metrics::record_message(query.payload.as_deref().map_or(0, str::len), "inbound");
    state.client_publish(
        query.uid(),
        query.topic.as_deref(),
        query.payload.as_deref().unwrap_or_default(),
    )?;
    Ok(html("<body>publish OK</body></html>"))
}

async fn disconnect_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    state.disconnect(query.uid())?;
    Ok(html("<body>disconnection OK</body></html>"))
}

async fn close_response_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CometQuery>,
) -> Result<Response, ApiError> {
    debug!(client = query.uid().unwrap_or("-"), "Close response channel");
    state.disconnect(query.uid())?;
    Ok(html("<body>close response OK</body></html>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushwire_core::LifecycleState;
    use pushwire_protocol::comet;
    use pushwire_transport::MemoryConnection;

    fn state() -> AppState {
        AppState::new(Config::default())
    }

    async fn drain(outbound: &mut Outbound) -> String {
        let mut text = String::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), outbound.recv()).await
        {
            text.push_str(&String::from_utf8_lossy(&chunk));
        }
        text
    }

    #[test]
    fn test_query_topics() {
        let query = CometQuery {
            topic: Some(" a, b,,c ".to_string()),
            ..Default::default()
        };
        assert_eq!(query.topics(), vec!["a", "b", "c"]);
        assert!(CometQuery::default().topics().is_empty());
    }

    #[test]
    fn test_missing_uid_is_rejected() {
        let state = state();
        assert_eq!(
            state.subscribe(None, &["T".to_string()]).unwrap_err(),
            ClientError::MissingUid
        );
        assert!(state.open_response(Some("")).is_err());
        assert!(state.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_response_stream_flushes_queue() {
        let state = state();
        state.subscribe(Some("browser"), &["AAPL".to_string()]).unwrap();
        state.publish("AAPL", Payload::new("AAPL").with_field("price", "1"));

        let (client, _connection, mut outbound) = state.open_response(Some("browser")).unwrap();
        assert_eq!(client.state(), LifecycleState::Connected);

        state.publish("AAPL", Payload::new("AAPL").with_field("price", "2"));

        let text = drain(&mut outbound).await;
        assert!(text.starts_with(RESPONSE_PREAMBLE));
        let prices: Vec<_> = comet::decode_scripts(&text[RESPONSE_PREAMBLE.len()..])
            .unwrap()
            .into_iter()
            .map(|f| f["price"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(prices, vec!["1", "2"]);
    }

    #[test]
    fn test_poll_returns_queued_batch() {
        let state = state();
        state.subscribe(Some("p"), &["T".to_string()]).unwrap();
        state.publish("T", Payload::new("T").with_field("n", "1"));
        state.publish("T", Payload::new("T").with_field("n", "2"));

        let batch = comet::decode_batch(&state.poll(Some("p")).unwrap()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(state.poll(Some("p")).unwrap(), "[]");
    }

    #[test]
    fn test_client_publish_is_relayed() {
        let state = state();
        let conn = Arc::new(MemoryConnection::new("d1"));
        let request =
            Request::new("reader", TransportKind::Direct).with_connection(conn.clone());
        let reader = state.engine.registry().find_or_create(&request).unwrap();
        reader.on_connect();
        state.engine.subscribe(&reader, "chat");

        state
            .client_publish(Some("writer"), None, r#"{"topic":"chat","message":"hi"}"#)
            .unwrap();

        assert_eq!(
            conn.written_text(),
            vec![r#"@@@@{"topic":"chat","message":"hi"}@@@@"#]
        );
    }

    #[test]
    fn test_client_publish_adds_topic() {
        let state = state();
        state.subscribe(Some("sub"), &["news".to_string()]).unwrap();

        state
            .client_publish(Some("pub"), Some("news"), r#"{"headline":"x"}"#)
            .unwrap();

        let batch = comet::decode_batch(&state.poll(Some("sub")).unwrap()).unwrap();
        assert_eq!(batch[0]["topic"], "news");
        assert_eq!(batch[0]["headline"], "x");
    }

    #[test]
    fn test_client_publish_errors() {
        let state = state();
        assert!(matches!(
            state.client_publish(Some("u"), None, "not json"),
            Err(ApiError::Payload(_))
        ));
        assert!(matches!(
            state.client_publish(Some("u"), None, r#"{"a":"b"}"#),
            Err(ApiError::MissingTopic)
        ));
    }

    #[test]
    fn test_relay_can_be_disabled() {
        let mut config = Config::default();
        config.payload.relay = false;
        let state = AppState::new(config);
        state.subscribe(Some("sub"), &["T".to_string()]).unwrap();

        state
            .client_publish(Some("pub"), Some("T"), r#"{"a":"b"}"#)
            .unwrap();

        assert_eq!(state.poll(Some("sub")).unwrap(), "[]");
    }

    #[test]
    fn test_server_timestamping() {
        let mut config = Config::default();
        config.payload.timestamping = true;
        let state = AppState::new(config);
        state.subscribe(Some("sub"), &["T".to_string()]).unwrap();

        state.publish("T", Payload::new("T"));

        let batch = comet::decode_batch(&state.poll(Some("sub")).unwrap()).unwrap();
        assert!(batch[0].contains_key("timestamp"));
    }

    #[test]
    fn test_disconnect_removes_client() {
        let state = state();
        state.subscribe(Some("gone"), &["T".to_string()]).unwrap();
        state.disconnect(Some("gone")).unwrap();

        assert_eq!(state.engine.subscriber_count("T"), 0);
        assert!(state.engine.registry().find("gone").is_none());
    }

    #[tokio::test]
    async fn test_dropped_response_loses_client() {
        let state = state();
        let (client, connection, outbound) = state.open_response(Some("b")).unwrap();
        let guard = ResponseGuard {
            client: Arc::clone(&client),
            connection: connection.id().clone(),
            _metrics: ConnectionMetricsGuard::new("comet"),
        };
        drop(outbound);
        drop(guard);

        assert_eq!(client.state(), LifecycleState::LostConnection);
    }
}
