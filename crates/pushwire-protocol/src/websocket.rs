//! Legacy WebSocket byte framing.
//!
//! Each frame is a text message between a `0x00` start byte and a `0xFF`
//! end byte. The parser only attempts extraction once the accumulated input
//! ends on an end byte; until then nothing is yielded and nothing is dropped.

use bytes::{Bytes, BytesMut};

/// Byte that opens a frame.
pub const START_BYTE: u8 = 0x00;

/// Byte that closes a frame.
pub const END_BYTE: u8 = 0xFF;

/// Wrap a text message in start/end markers.
#[must_use]
pub fn encode(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 2);
    buf.extend_from_slice(&[START_BYTE]);
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(&[END_BYTE]);
    buf.freeze()
}

/// Extract the interior of every `0x00 ... 0xFF` span in order.
///
/// A later start byte restarts the current span; an end byte with no open
/// span is ignored.
#[must_use]
pub fn parse_frames(raw: &[u8]) -> Vec<String> {
    let mut messages = Vec::new();
    let mut start = None;

    for (i, &byte) in raw.iter().enumerate() {
        match byte {
            START_BYTE => start = Some(i + 1),
            END_BYTE => {
                if let Some(s) = start.take() {
                    messages.push(String::from_utf8_lossy(&raw[s..i]).into_owned());
                }
            }
            _ => {}
        }
    }

    messages
}

/// Accumulating frame parser for one connection.
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
}

impl FrameParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. When the accumulated input ends on an end byte, all
    /// frames are extracted and the buffer is cleared.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.last() != Some(&END_BYTE) {
            return Vec::new();
        }

        let messages = parse_frames(&self.buffer);
        self.buffer.clear();
        messages
    }

    /// Number of accumulated bytes not yet parsed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
