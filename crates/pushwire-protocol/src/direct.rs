//! Direct protocol framing.
//!
//! Thick clients exchange text messages over a raw duplex socket. Every
//! logical message is wrapped in the separator on both sides:
//!
//! ```text
//! @@@@uid=client-1@@@@@@@@subscribe=AAPL,MSFT@@@@
//! ```
//!
//! Reads can split a message (or the separator itself) at any byte, so
//! parsing always works on the accumulated input.

use bytes::{Bytes, BytesMut};

/// Separator placed before and after every Direct message.
pub const SEPARATOR: &str = "@@@@";

const SEPARATOR_BYTES: &[u8] = SEPARATOR.as_bytes();

/// Frame a message for the Direct wire.
#[must_use]
pub fn encode(message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(message.len() + 2 * SEPARATOR_BYTES.len());
    buf.extend_from_slice(SEPARATOR_BYTES);
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(SEPARATOR_BYTES);
    buf.freeze()
}

/// Extract every complete `SEP...SEP` span from `input`, skipping the first
/// `offset` spans.
///
/// A caller that already consumed `K` messages from a growing input passes
/// `offset = K` and receives only the new ones.
#[must_use]
pub fn extract_messages(input: &[u8], offset: usize) -> Vec<String> {
    let (spans, _) = scan(input);
    spans
        .into_iter()
        .skip(offset)
        .map(|(start, end)| String::from_utf8_lossy(&input[start..end]).into_owned())
        .collect()
}

/// Locate complete spans. Returns the interior ranges and the index just past
/// the last closing separator.
fn scan(input: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let mut spans = Vec::new();
    let mut cursor = 0;
    let mut consumed = 0;

    while let Some(open) = find(input, cursor) {
        let body_start = open + SEPARATOR_BYTES.len();
        // A message holds at least one byte.
        let Some(close) = find(input, body_start + 1) else {
            break;
        };
        spans.push((body_start, close));
        cursor = close + SEPARATOR_BYTES.len();
        consumed = cursor;
    }

    (spans, consumed)
}

fn find(haystack: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(SEPARATOR_BYTES.len())
        .position(|window| window == SEPARATOR_BYTES)
        .map(|pos| pos + from)
}

/// Streaming Direct parser.
///
/// Accumulates read chunks and yields each complete message exactly once.
/// Input up to the end of the last complete message is discarded, which is
/// equivalent to re-scanning the whole stream with an ever-growing offset.
#[derive(Debug, Default)]
pub struct DirectParser {
    buffer: BytesMut,
}

impl DirectParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the messages it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let (spans, consumed) = scan(&self.buffer);
        let messages: Vec<String> = spans
            .iter()
            .map(|&(start, end)| String::from_utf8_lossy(&self.buffer[start..end]).into_owned())
            .collect();

        if consumed > 0 {
            let _ = self.buffer.split_to(consumed);
        }
        messages
    }

    /// Number of bytes waiting for a closing separator.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
