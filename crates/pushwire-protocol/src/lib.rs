//! # pushwire-protocol
//!
//! Wire framing for the pushwire push server.
//!
//! Three transports share one subscription model but nothing on the wire:
//!
//! - **Direct** - `@@@@`-delimited text over a raw duplex socket
//! - **WebSocket** - legacy `0x00 ... 0xFF` byte framing
//! - **Comet** - script callbacks for streaming, JSON arrays for polling
//!
//! Streaming adapters, external publishers, speak their own instruction set
//! over Direct framing (see [`adapter`]).
//!
//! Framing never fails: incomplete input simply yields no messages yet.
//!
//! ## Example
//!
//! ```rust
//! use pushwire_protocol::{direct, Instruction};
//!
//! let mut parser = direct::DirectParser::new();
//! assert!(parser.push(b"@@@@subscribe=AA").is_empty());
//!
//! let messages = parser.push(b"PL@@@@");
//! assert_eq!(
//!     Instruction::parse(&messages[0]),
//!     Instruction::Subscribe(vec!["AAPL".to_string()])
//! );
//! ```

pub mod adapter;
pub mod codec;
pub mod comet;
pub mod direct;
pub mod instruction;
pub mod websocket;

pub use adapter::AdapterInstruction;
pub use codec::{Fields, ProtocolError};
pub use direct::DirectParser;
pub use instruction::Instruction;
pub use websocket::FrameParser;
