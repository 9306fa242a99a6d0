//! # pushwire-core
//!
//! Clients, the bounded client registry, and the subscription engine for
//! the pushwire push server.
//!
//! - **Payload** - ordered string fields with cached per-transport encodings
//! - **Client** - one subscriber identity and its connection lifecycle,
//!   in Comet, Direct and WebSocket flavours
//! - **Registry** - uid → client map with FIFO eviction at capacity
//! - **Engine** - topic index, fan-out, listeners, reconnection grace
//! - **Session** - applies inbound socket instructions to the engine
//! - **Adapter** - streaming adapter sockets publishing into the engine and
//!   receiving its events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌────────────────────┐     ┌─────────────┐
//! │   Session   │────▶│ SubscriptionEngine │────▶│   Client    │──▶ Connection
//! └─────────────┘     └────────────────────┘     └─────────────┘
//!                        │        ▲                     │
//!                        ▼        └───── lifecycle ─────┘
//!                 ┌─────────────┐
//!                 │  Registry   │
//!                 └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pushwire_core::{Payload, SubscriptionEngine};
//! use pushwire_transport::{MemoryConnection, Request, TransportKind};
//!
//! let engine = SubscriptionEngine::new();
//! let conn = Arc::new(MemoryConnection::new("c1"));
//! let client = engine
//!     .registry()
//!     .find_or_create(&Request::new("alice", TransportKind::Direct).with_connection(conn.clone()))
//!     .unwrap();
//! client.on_connect();
//!
//! engine.subscribe(&client, "AAPL");
//! engine.publish("AAPL", Arc::new(Payload::new("AAPL").with_field("price", "101.5")));
//!
//! assert_eq!(
//!     conn.written_text(),
//!     vec![r#"@@@@{"topic":"AAPL","price":"101.5"}@@@@"#]
//! );
//! ```

pub mod adapter;
pub mod client;
pub mod engine;
pub mod listener;
pub mod message;
pub mod payload;
pub mod registry;
pub mod session;

pub use adapter::{AdapterRegistry, AdapterSession, RemoteAdapter};
pub use client::{Client, ClientError, CometClient, DirectClient, LifecycleState, WebSocketClient};
pub use engine::{EngineConfig, EngineStats, SubscriptionEngine};
pub use listener::{ConnectionListener, PublishListener, SubscribeListener, UnsubscribeListener};
pub use message::Message;
pub use payload::Payload;
pub use registry::{CircularFifoMap, ClientFactory, ClientRegistry, RegistryStats};
pub use session::{DirectSession, Flow, Session, WebSocketSession};
