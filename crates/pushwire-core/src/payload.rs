//! Topic-tagged message payloads.
//!
//! A [`Payload`] is an ordered map of string fields that always carries a
//! `topic`. Its encodings (bare JSON text plus the framed bytes for each
//! transport) are computed lazily and cached until the next field is added.

use bytes::Bytes;
use pushwire_protocol::{codec, comet, direct, websocket, Fields, ProtocolError};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

/// Name of the field every payload carries.
pub const TOPIC_FIELD: &str = "topic";

/// Name of the field added by [`Payload::timestamp`].
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// A message body: ordered string fields with cached encodings.
#[derive(Clone, Default)]
pub struct Payload {
    fields: Fields,
    timestamping: bool,
    /// Last text that encoded successfully, used if a later encode fails.
    fallback: Option<String>,
    text: OnceLock<String>,
    comet: OnceLock<Bytes>,
    direct: OnceLock<Bytes>,
    websocket: OnceLock<Bytes>,
}

impl Payload {
    /// Create a payload for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        let mut payload = Self::default();
        payload.add_field(TOPIC_FIELD, topic);
        payload
    }

    /// Build a payload from already decoded fields.
    #[must_use]
    pub fn from_fields(fields: Fields) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    /// Decode a payload from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a JSON object.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        codec::decode_fields(json).map(Self::from_fields)
    }

    /// Decode a payload from URL-encoded JSON, as sent by clients.
    ///
    /// Field order follows the source. Non-string values are kept as their
    /// JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is not valid percent-encoded UTF-8 or
    /// does not decode to a JSON object.
    pub fn from_url_encoded_json(source: &str) -> Result<Self, ProtocolError> {
        codec::decode_url_encoded_fields(source).map(Self::from_fields)
    }

    /// Add or overwrite a field. Cached encodings are discarded.
    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), Value::String(value.into()));
        self.invalidate();
    }

    /// Builder form of [`add_field`](Self::add_field).
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_field(key, value);
        self
    }

    /// All fields in insertion order.
    #[must_use]
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Value of a single field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The payload's topic, or `""` for a decoded payload that lacks one.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.get(TOPIC_FIELD).unwrap_or_default()
    }

    /// Enable or disable per-send timestamping. Off by default.
    pub fn toggle_timestamping(&mut self, enabled: bool) {
        self.timestamping = enabled;
    }

    /// Whether per-send timestamping is enabled.
    #[must_use]
    pub fn is_timestamping(&self) -> bool {
        self.timestamping
    }

    /// Stamp the current epoch milliseconds into the `timestamp` field.
    ///
    /// Does nothing unless timestamping is enabled.
    pub fn timestamp(&mut self) {
        if self.timestamping {
            self.add_field(TIMESTAMP_FIELD, epoch_millis().to_string());
        }
    }

    /// The payload as it should be encoded for one send.
    ///
    /// Shared payloads are never mutated; when timestamping is on this
    /// returns a stamped copy.
    #[must_use]
    pub fn stamped(&self) -> Cow<'_, Payload> {
        if self.timestamping {
            let mut copy = self.clone();
            copy.timestamp();
            Cow::Owned(copy)
        } else {
            Cow::Borrowed(self)
        }
    }

    /// Canonical text form: the bare JSON object.
    ///
    /// If encoding fails the previous good text is returned, or `""` if
    /// there never was one.
    #[must_use]
    pub fn to_text(&self) -> &str {
        self.text.get_or_init(|| match codec::encode_fields(&self.fields) {
            Ok(text) => text,
            Err(e) => {
                error!(topic = %self.topic(), error = %e, "Failed to encode payload");
                self.fallback.clone().unwrap_or_default()
            }
        })
    }

    /// Script-callback encoding pushed to streaming Comet responses.
    #[must_use]
    pub fn to_comet_bytes(&self) -> Bytes {
        self.comet
            .get_or_init(|| self.framed(comet::wrap_script))
            .clone()
    }

    /// `@@@@`-delimited encoding for Direct sockets.
    #[must_use]
    pub fn to_direct_bytes(&self) -> Bytes {
        self.direct.get_or_init(|| self.framed(direct::encode)).clone()
    }

    /// `0x00 ... 0xFF` framed encoding for WebSocket clients.
    #[must_use]
    pub fn to_websocket_bytes(&self) -> Bytes {
        self.websocket
            .get_or_init(|| self.framed(websocket::encode))
            .clone()
    }

    fn framed(&self, frame: fn(&str) -> Bytes) -> Bytes {
        match self.to_text() {
            "" => Bytes::new(),
            text => frame(text),
        }
    }

    fn invalidate(&mut self) {
        if let Some(text) = self.text.take().filter(|t| !t.is_empty()) {
            self.fallback = Some(text);
        }
        self.comet.take();
        self.direct.take();
        self.websocket.take();
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_text())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("fields", &self.fields)
            .field("timestamping", &self.timestamping)
            .finish()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
