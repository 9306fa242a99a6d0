//! Streaming adapter protocol.
//!
//! A streaming adapter is an external publisher on its own Direct socket. It
//! can publish to topics, send to a single client, and register itself as a
//! subscribe or publish listener. The server answers listener registrations
//! with `@@@@`-framed events:
//!
//! ```text
//! -> @@@@uid=feed-1@@@@@@@@addSubscriptionListener@@@@
//! <- @@@@onSubscribe(AAPL,browser-7)@@@@
//! -> @@@@publish(AAPL,{"price":"101.5"})@@@@
//! ```
//!
//! Adapter payloads are plain JSON, not URL-encoded.

use bytes::Bytes;

use crate::direct;

/// A decoded adapter message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterInstruction {
    /// Name the adapter (`uid=<id>`).
    Connect {
        /// Adapter identifier.
        uid: String,
    },

    /// Receive `onSubscribe`/`onUnSubscribe` events.
    AddSubscriptionListener,

    /// Stop receiving subscription events.
    RemoveSubscriptionListener,

    /// Receive `onMessageReceived` events for client publishes.
    AddPublishListener,

    /// Stop receiving publish events.
    RemovePublishListener,

    /// Publish to every subscriber (`publish(<topic>,<json>)`).
    Publish {
        /// Target topic.
        topic: String,
        /// JSON object source.
        payload: String,
    },

    /// Send to one client (`send(<uid>,<topic>,<json>)`).
    Send {
        /// Target client.
        uid: String,
        /// Topic reported to the client.
        topic: String,
        /// JSON object source.
        payload: String,
    },

    /// Anything that could not be decoded.
    Unknown(String),
}

impl AdapterInstruction {
    /// Decode a single framed message.
    #[must_use]
    pub fn parse(message: &str) -> Self {
        let unknown = || AdapterInstruction::Unknown(message.to_string());

        if message.starts_with("publish") {
            return parse_publish(message).unwrap_or_else(unknown);
        }
        if message.starts_with("send") {
            return parse_send(message).unwrap_or_else(unknown);
        }
        if message.starts_with("uid=") {
            return match message.split('=').nth(1) {
                Some(uid) if !uid.is_empty() => AdapterInstruction::Connect {
                    uid: uid.to_string(),
                },
                _ => unknown(),
            };
        }

        match message {
            "addSubscriptionListener" => AdapterInstruction::AddSubscriptionListener,
            "removeSubscriptionListener" => AdapterInstruction::RemoveSubscriptionListener,
            "addPublishListener" => AdapterInstruction::AddPublishListener,
            "removePublishListener" => AdapterInstruction::RemovePublishListener,
            _ => unknown(),
        }
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterInstruction::Connect { .. } => "connect",
            AdapterInstruction::AddSubscriptionListener => "add_subscription_listener",
            AdapterInstruction::RemoveSubscriptionListener => "remove_subscription_listener",
            AdapterInstruction::AddPublishListener => "add_publish_listener",
            AdapterInstruction::RemovePublishListener => "remove_publish_listener",
            AdapterInstruction::Publish { .. } => "publish",
            AdapterInstruction::Send { .. } => "send",
            AdapterInstruction::Unknown(_) => "unknown",
        }
    }
}

/// Arguments between `name(` and the closing `)`.
fn call_args<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    message.strip_prefix(name)?.strip_prefix('(')?.strip_suffix(')')
}

fn parse_publish(message: &str) -> Option<AdapterInstruction> {
    let (topic, payload) = call_args(message, "publish")?.split_once(',')?;
    if topic.is_empty() {
        return None;
    }
    Some(AdapterInstruction::Publish {
        topic: topic.to_string(),
        payload: payload.to_string(),
    })
}

fn parse_send(message: &str) -> Option<AdapterInstruction> {
    let mut args = call_args(message, "send")?.splitn(3, ',');
    let uid = args.next().filter(|s| !s.is_empty())?;
    let topic = args.next().filter(|s| !s.is_empty())?;
    let payload = args.next()?;
    Some(AdapterInstruction::Send {
        uid: uid.to_string(),
        topic: topic.to_string(),
        payload: payload.to_string(),
    })
}

/// `client` subscribed to `topic`.
#[must_use]
pub fn on_subscribe(topic: &str, client: &str) -> Bytes {
    direct::encode(&format!("onSubscribe({topic},{client})"))
}

/// `client` unsubscribed from `topic`.
#[must_use]
pub fn on_unsubscribe(topic: &str, client: &str) -> Bytes {
    direct::encode(&format!("onUnSubscribe({topic},{client})"))
}

/// `client` published `payload` (JSON text) on `topic`.
#[must_use]
pub fn on_message_received(client: &str, topic: &str, payload: &str) -> Bytes {
    direct::encode(&format!("onMessageReceived({client},{topic},{payload})"))
}
