//! Plain TCP transport.
//!
//! Both the Direct and the framed WebSocket listeners accept raw TCP
//! streams; the difference is only in how the session parses the bytes.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::channel::{ChannelConnection, DEFAULT_OUTBOUND_BUFFER};
use crate::traits::{Accepted, ConnectionId, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Per-connection outbound queue length.
    pub outbound_buffer: usize,
    /// Name reported by [`Transport::name`].
    pub name: &'static str,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            name: "tcp",
        }
    }
}

/// Accepts TCP streams and splits them into a [`ChannelConnection`] and a reader.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Bind a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!(
            transport = config.name,
            "Listening on {}",
            listener.local_addr().unwrap_or(config.bind_addr)
        );

        Ok(Self { listener, config })
    }

    /// Bind with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, name: &'static str) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            name,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Accepted, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;
        let _ = stream.set_nodelay(true);

        debug!(transport = self.config.name, "Accepted TCP connection from {}", addr);

        let (read_half, write_half) = stream.into_split();
        let (connection, outbound) = ChannelConnection::with_remote_addr(
            ConnectionId::generate(),
            self.config.outbound_buffer,
            addr.to_string(),
        );
        connection.spawn_writer(outbound, write_half);

        Ok(Accepted {
            connection,
            reader: Box::new(read_half),
        })
    }

    fn name(&self) -> &'static str {
        self.config.name
    }
}
