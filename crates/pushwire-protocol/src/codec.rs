//! Field codec for pushwire payloads.
//!
//! Payloads travel as flat JSON objects whose values are strings. This module
//! renders an ordered field map to its canonical text and decodes inbound
//! (optionally URL-encoded) JSON back into fields.

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use thiserror::Error;

/// Ordered field map used by payloads.
pub type Fields = Map<String, Value>;

/// Protocol errors that can occur while encoding or decoding payload fields.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Decoded JSON was valid but not an object.
    #[error("Expected a JSON object, got: {0}")]
    NotAnObject(String),

    /// Percent-decoded bytes were not valid UTF-8.
    #[error("Invalid URL encoding: {0}")]
    UrlEncoding(#[from] std::str::Utf8Error),
}

/// Encode fields as a compact JSON object.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_fields(fields: &Fields) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(fields)?)
}

/// Decode a JSON object into string-valued fields.
///
/// Non-string values are kept in their JSON text form so that every field
/// reads back as a string.
///
/// # Errors
///
/// Returns an error if the text is not valid JSON or not an object.
pub fn decode_fields(json: &str) -> Result<Fields, ProtocolError> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(object) => Ok(object
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(_) => (key, value),
                other => (key, Value::String(other.to_string())),
            })
            .collect()),
        other => Err(ProtocolError::NotAnObject(other.to_string())),
    }
}

/// Decode form-style URL encoding: `+` is a space, `%XX` is a byte.
///
/// # Errors
///
/// Returns an error if the decoded bytes are not UTF-8.
pub fn url_decode(source: &str) -> Result<String, ProtocolError> {
    let spaced = source.replace('+', " ");
    let decoded = percent_decode_str(&spaced).decode_utf8()?;
    Ok(decoded.into_owned())
}

/// Decode URL-encoded JSON into fields.
///
/// # Errors
///
/// Returns an error if URL decoding or JSON decoding fails.
pub fn decode_url_encoded_fields(source: &str) -> Result<Fields, ProtocolError> {
    decode_fields(&url_decode(source)?)
}
