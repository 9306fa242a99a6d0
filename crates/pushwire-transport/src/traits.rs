//! Transport abstraction traits for pushwire.
//!
//! The core never touches sockets. It writes encoded bytes through a
//! [`Connection`] and learns about new streams through a [`Transport`].

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::channel::ChannelConnection;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{}", timestamp, counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound buffer is full; the peer is not keeping up.
    #[error("Outbound buffer full")]
    Backpressure,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether this is the expected closed-channel condition rather than a
    /// genuine fault.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            TransportError::ConnectionClosed => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// A live, writable connection to one client.
///
/// Writes must not block on the peer: implementations buffer and report
/// overflow as an error instead.
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Write pre-encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection has
    /// been closed, or another error if the bytes cannot be queued.
    fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Check if the connection has been closed.
    fn is_closed(&self) -> bool;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A freshly accepted stream: the writable half bound to a connection and
/// the raw readable half for the session to parse.
pub struct Accepted {
    /// Outbound side.
    pub connection: Arc<ChannelConnection>,
    /// Inbound side.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Accepted, TransportError>;

    /// Get the transport name (e.g., "direct", "websocket").
    fn name(&self) -> &'static str;
}
