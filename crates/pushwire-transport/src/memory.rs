//! In-memory connection for tests and benchmarks.

use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::traits::{Connection, ConnectionId, TransportError};

/// How writes should fail, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailMode {
    None,
    Closed,
    Io,
    Send,
}

/// Records everything written to it.
#[derive(Debug)]
pub struct MemoryConnection {
    id: ConnectionId,
    written: Mutex<Vec<Bytes>>,
    fail: Mutex<FailMode>,
    closed: AtomicBool,
    close_count: AtomicUsize,
}

impl MemoryConnection {
    /// Create an open connection.
    #[must_use]
    pub fn new(id: impl Into<ConnectionId>) -> Self {
        Self {
            id: id.into(),
            written: Mutex::new(Vec::new()),
            fail: Mutex::new(FailMode::None),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Make subsequent writes fail as if the peer went away.
    pub fn fail_closed(&self) {
        *self.fail.lock() = FailMode::Closed;
    }

    /// Make subsequent writes fail with a broken pipe.
    pub fn fail_io(&self) {
        *self.fail.lock() = FailMode::Io;
    }

    /// Make subsequent writes fail with a fault that is not a closed channel.
    pub fn fail_send(&self) {
        *self.fail.lock() = FailMode::Send;
    }

    /// Every successful write, in order.
    #[must_use]
    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Every successful write as lossy UTF-8.
    #[must_use]
    pub fn written_text(&self) -> Vec<String> {
        self.written
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// All written bytes concatenated.
    #[must_use]
    pub fn concat(&self) -> Vec<u8> {
        self.written.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Discard recorded writes.
    pub fn clear(&self) {
        self.written.lock().clear();
    }
}

impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        match *self.fail.lock() {
            FailMode::None => {
                self.written.lock().push(data);
                Ok(())
            }
            FailMode::Closed => Err(TransportError::ConnectionClosed),
            FailMode::Io => Err(TransportError::Io(io::ErrorKind::BrokenPipe.into())),
            FailMode::Send => Err(TransportError::SendFailed("memory connection refused write".into())),
        }
    }

    fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
