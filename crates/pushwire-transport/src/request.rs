//! Inbound request context.
//!
//! Every client-facing operation starts from a [`Request`]: who is asking,
//! over which transport, and (for streaming requests) the connection to
//! push through.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::traits::Connection;

/// The three supported client transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Long-lived HTTP response carrying script callbacks, or polled batches.
    Comet,
    /// Raw duplex socket with `@@@@`-delimited messages.
    Direct,
    /// Legacy byte-framed WebSocket.
    WebSocket,
}

impl TransportKind {
    /// Lowercase name used in logs, config and metrics labels.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Comet => "comet",
            TransportKind::Direct => "direct",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "comet" => Ok(TransportKind::Comet),
            "direct" => Ok(TransportKind::Direct),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// Identifies the caller of an operation.
#[derive(Clone, Default)]
pub struct Request {
    uid: Option<String>,
    transport: Option<TransportKind>,
    connection: Option<Arc<dyn Connection>>,
}

impl Request {
    /// A request from `uid` over `transport`.
    #[must_use]
    pub fn new(uid: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            uid: Some(uid.into()),
            transport: Some(transport),
            connection: None,
        }
    }

    /// A request whose transport could not be determined.
    #[must_use]
    pub fn untyped(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            ..Self::default()
        }
    }

    /// Attach the streaming connection this request arrived on.
    #[must_use]
    pub fn with_connection(mut self, connection: Arc<dyn Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Client identifier, if the request carried one.
    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref().filter(|uid| !uid.is_empty())
    }

    /// Transport the request arrived on.
    #[must_use]
    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    /// Streaming connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<dyn Connection>> {
        self.connection.as_ref()
    }

    /// Whether this request opens the long-lived push channel rather than
    /// issuing a one-shot command.
    #[must_use]
    pub fn is_response_connection(&self) -> bool {
        self.connection.is_some()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("uid", &self.uid)
            .field("transport", &self.transport)
            .field("connection", &self.connection.as_ref().map(|c| c.id().clone()))
            .finish()
    }
}
