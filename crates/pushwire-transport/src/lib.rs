//! # pushwire-transport
//!
//! Connection abstraction for the pushwire push server.
//!
//! The core writes pre-framed bytes through a [`Connection`]; this crate
//! supplies the implementations:
//!
//! - [`ChannelConnection`] - bounded queue drained by a writer task, used for
//!   TCP sockets and streaming HTTP bodies
//! - [`MemoryConnection`] - records writes, for tests and benchmarks
//!
//! [`TcpTransport`] accepts raw streams for the Direct and WebSocket listeners.
//!
//! ```rust
//! use bytes::Bytes;
//! use pushwire_transport::{Connection, MemoryConnection};
//!
//! let conn = MemoryConnection::new("example");
//! conn.write(Bytes::from_static(b"@@@@hi@@@@")).unwrap();
//! assert_eq!(conn.written_text(), vec!["@@@@hi@@@@"]);
//! ```

pub mod channel;
pub mod memory;
pub mod request;
pub mod tcp;
pub mod traits;

pub use channel::{ChannelConnection, Outbound};
pub use memory::MemoryConnection;
pub use request::{Request, TransportKind};
pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{Accepted, Connection, ConnectionId, Transport, TransportError};
