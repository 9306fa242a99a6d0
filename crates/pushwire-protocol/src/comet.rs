//! Comet (HTTP streaming / polling) formats.
//!
//! Live pushes on a streaming response are independent script callbacks:
//!
//! ```text
//! <script>x({"topic":"AAPL","price":"101.5"});</script>
//! ```
//!
//! A poll response instead carries every pending payload as one JSON array
//! of bare objects.

use bytes::{Bytes, BytesMut};

use crate::codec::{decode_fields, Fields, ProtocolError};

/// Opening of a script callback.
pub const SCRIPT_START: &str = "<script>x(";

/// Closing of a script callback.
pub const SCRIPT_END: &str = ");</script>";

/// Wrap a JSON object in a script callback.
#[must_use]
pub fn wrap_script(json: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(SCRIPT_START.len() + json.len() + SCRIPT_END.len());
    buf.extend_from_slice(SCRIPT_START.as_bytes());
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(SCRIPT_END.as_bytes());
    buf.freeze()
}

/// Extract the callback arguments of every complete script in a streamed
/// body, in order.
#[must_use]
pub fn extract_scripts(body: &str) -> Vec<&str> {
    let mut messages = Vec::new();
    let mut rest = body;

    while let Some(open) = rest.find(SCRIPT_START) {
        let after = &rest[open + SCRIPT_START.len()..];
        let Some(close) = after.find(SCRIPT_END) else {
            break;
        };
        messages.push(&after[..close]);
        rest = &after[close + SCRIPT_END.len()..];
    }

    messages
}

/// Decode every script callback in a streamed body into fields.
///
/// # Errors
///
/// Returns an error if a callback argument is not a JSON object.
pub fn decode_scripts(body: &str) -> Result<Vec<Fields>, ProtocolError> {
    extract_scripts(body).into_iter().map(decode_fields).collect()
}

/// Render payload texts as a single `[a,b,...]` array.
#[must_use]
pub fn encode_batch<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(item);
    }
    out.push(']');
    out
}

/// Decode a poll response body into fields, one entry per payload.
///
/// # Errors
///
/// Returns an error if the body is not an array of JSON objects.
pub fn decode_batch(body: &str) -> Result<Vec<Fields>, ProtocolError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(body)?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::Object(object) => Ok(object),
            other => Err(ProtocolError::NotAnObject(other.to_string())),
        })
        .collect()
}
