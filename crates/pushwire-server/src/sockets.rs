//! Direct, framed WebSocket and streaming adapter socket listeners.
//!
//! Each accepted stream gets its own session task. Outbound bytes go through
//! the connection's bounded queue, so a slow socket never blocks fan-out.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use pushwire_core::session::Framing;
use pushwire_core::{AdapterRegistry, AdapterSession, Session, SubscriptionEngine};
use pushwire_protocol::{DirectParser, FrameParser};
use pushwire_transport::{Accepted, TcpConfig, TcpTransport, Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const ADAPTER: &str = "adapter";

/// Bind the Direct listener and start accepting.
///
/// # Errors
///
/// Returns an error if binding fails.
pub async fn spawn_direct(
    addr: SocketAddr,
    config: &Config,
    engine: Arc<SubscriptionEngine>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, TransportError> {
    bind::<DirectParser>(addr, config, engine, shutdown).await
}

/// Bind the framed WebSocket listener and start accepting.
///
/// # Errors
///
/// Returns an error if binding fails.
pub async fn spawn_websocket(
    addr: SocketAddr,
    config: &Config,
    engine: Arc<SubscriptionEngine>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, TransportError> {
    bind::<FrameParser>(addr, config, engine, shutdown).await
}

/// Bind the streaming adapter listener and start accepting.
///
/// # Errors
///
/// Returns an error if binding fails.
pub async fn spawn_adapter(
    addr: SocketAddr,
    config: &Config,
    adapters: Arc<AdapterRegistry>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, TransportError> {
    let transport = TcpTransport::new(TcpConfig {
        bind_addr: addr,
        outbound_buffer: config.limits.outbound_buffer,
        name: ADAPTER,
    })
    .await?;

    Ok(tokio::spawn(adapter_accept_loop(
        transport,
        adapters,
        config.limits.max_message_size,
        shutdown,
    )))
}

async fn bind<F: Framing + 'static>(
    addr: SocketAddr,
    config: &Config,
    engine: Arc<SubscriptionEngine>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, TransportError> {
    let transport = TcpTransport::new(TcpConfig {
        bind_addr: addr,
        outbound_buffer: config.limits.outbound_buffer,
        name: F::TRANSPORT.as_str(),
    })
    .await?;
    let max_pending = config.limits.max_message_size;

    Ok(tokio::spawn(accept_loop::<F>(
        transport,
        engine,
        max_pending,
        shutdown,
    )))
}

/// Accept streams until `shutdown` is cancelled.
pub async fn accept_loop<F: Framing + 'static>(
    transport: TcpTransport,
    engine: Arc<SubscriptionEngine>,
    max_pending: usize,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = transport.accept() => accepted,
        };

        match accepted {
            Ok(Accepted { connection, reader }) => {
                let session =
                    Session::<F>::new(Arc::clone(&engine), connection).with_max_pending(max_pending);
                debug!(transport = transport.name(), "Session started");
                tokio::spawn(async move {
                    let _metrics = ConnectionMetricsGuard::new(F::TRANSPORT.as_str());
                    session.run(reader).await;
                });
            }
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error("accept");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    info!(transport = transport.name(), "Listener stopped");
}

/// Accept streaming adapters until `shutdown` is cancelled.
pub async fn adapter_accept_loop(
    transport: TcpTransport,
    adapters: Arc<AdapterRegistry>,
    max_pending: usize,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = transport.accept() => accepted,
        };

        match accepted {
            Ok(Accepted { connection, reader }) => {
                let session = AdapterSession::new(Arc::clone(&adapters), connection)
                    .with_max_pending(max_pending);
                debug!(transport = transport.name(), "Adapter session started");
                tokio::spawn(async move {
                    let _metrics = ConnectionMetricsGuard::new(ADAPTER);
                    session.run(reader).await;
                });
            }
            Err(e) => {
                warn!(transport = transport.name(), error = %e, "Accept failed");
                metrics::record_error("accept");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    info!(transport = transport.name(), "Listener stopped");
}
