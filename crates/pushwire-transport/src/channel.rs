//! Channel-backed connection.
//!
//! Writes go into a bounded queue that a separate task drains into the real
//! socket (or HTTP body). A slow peer therefore fills its own queue and gets
//! disconnected instead of stalling whoever is publishing.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::traits::{Connection, ConnectionId, TransportError};

/// Default number of queued writes per connection.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 1024;

/// A connection whose writes are queued for a drain task.
#[derive(Debug)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    remote_addr: Option<String>,
}

/// Receiving end of a [`ChannelConnection`].
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl ChannelConnection {
    /// Create a connection with room for `capacity` queued writes.
    #[must_use]
    pub fn new(id: ConnectionId, capacity: usize) -> (Arc<Self>, Outbound) {
        Self::build(id, capacity, None)
    }

    /// Create a connection that records the peer address.
    #[must_use]
    pub fn with_remote_addr(
        id: ConnectionId,
        capacity: usize,
        remote_addr: impl Into<String>,
    ) -> (Arc<Self>, Outbound) {
        Self::build(id, capacity, Some(remote_addr.into()))
    }

    fn build(
        id: ConnectionId,
        capacity: usize,
        remote_addr: Option<String>,
    ) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        let conn = Arc::new(Self {
            id,
            tx,
            closed: closed.clone(),
            remote_addr,
        });
        (conn, Outbound { rx, closed })
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Spawn a task that drains queued writes into `writer`.
    ///
    /// The task ends when the connection is closed or a write fails; a
    /// failed write closes the connection so that the next `write` reports it.
    pub fn spawn_writer<W>(self: &Arc<Self>, mut outbound: Outbound, mut writer: W) -> JoinHandle<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(data) = outbound.recv().await {
                trace!(connection = %conn.id, bytes = data.len(), "Writing");
                let result = async {
                    writer.write_all(&data).await?;
                    writer.flush().await
                }
                .await;

                if let Err(e) = result {
                    debug!(connection = %conn.id, error = %e, "Write failed, closing");
                    conn.close();
                    break;
                }
            }
            let _ = writer.shutdown().await;
            debug!(connection = %conn.id, "Writer finished");
        })
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }

        self.tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                self.closed.cancel();
                TransportError::ConnectionClosed
            }
        })
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.clone()
    }
}

impl Outbound {
    /// Next queued write, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            data = self.rx.recv() => data,
        }
    }

    /// Convert into a byte stream, e.g. for a streaming HTTP body.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        stream::unfold(self, |mut outbound| async move {
            outbound.recv().await.map(|data| (Ok(data), outbound))
        })
    }
}
