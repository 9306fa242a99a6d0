//! Inbound instructions carried by Direct and WebSocket messages.
//!
//! Framing only yields message text; this module turns that text into
//! something the server can act on.

/// A decoded client instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Handshake binding the stream to a client identifier (`uid=<id>`).
    Connect {
        /// Client identifier.
        uid: String,
    },

    /// Subscribe to one or more topics (`subscribe=A,B`).
    Subscribe(Vec<String>),

    /// Unsubscribe from one or more topics (`unsubscribe=A,B`).
    Unsubscribe(Vec<String>),

    /// Publish a payload (`publish(<topic>,<json>)`).
    Publish {
        /// Target topic.
        topic: String,
        /// Raw, possibly URL-encoded, JSON source.
        payload: String,
    },

    /// Deliberate disconnect (`disconnect`).
    Disconnect,

    /// Anything that could not be decoded.
    Unknown(String),
}

impl Instruction {
    /// Decode a single framed message.
    #[must_use]
    pub fn parse(message: &str) -> Self {
        if message.starts_with("uid=") {
            return match message.split('=').nth(1) {
                Some(uid) if !uid.is_empty() => Instruction::Connect {
                    uid: uid.to_string(),
                },
                _ => Instruction::Unknown(message.to_string()),
            };
        }

        if message.starts_with("subscribe") {
            return match topics(message) {
                Some(list) => Instruction::Subscribe(list),
                None => Instruction::Unknown(message.to_string()),
            };
        }

        if message.starts_with("unsubscribe") {
            return match topics(message) {
                Some(list) => Instruction::Unsubscribe(list),
                None => Instruction::Unknown(message.to_string()),
            };
        }

        if message.starts_with("disconnect") {
            return Instruction::Disconnect;
        }

        if message.starts_with("publish") {
            return parse_publish(message)
                .unwrap_or_else(|| Instruction::Unknown(message.to_string()));
        }

        Instruction::Unknown(message.to_string())
    }

    /// Short name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::Connect { .. } => "connect",
            Instruction::Subscribe(_) => "subscribe",
            Instruction::Unsubscribe(_) => "unsubscribe",
            Instruction::Publish { .. } => "publish",
            Instruction::Disconnect => "disconnect",
            Instruction::Unknown(_) => "unknown",
        }
    }
}

fn topics(message: &str) -> Option<Vec<String>> {
    let list = message.split('=').nth(1)?;
    let topics: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    if topics.is_empty() {
        None
    } else {
        Some(topics)
    }
}

fn parse_publish(message: &str) -> Option<Instruction> {
    let open = message.find('(')?;
    let comma = message.find(',')?;
    if comma < open || !message.ends_with(')') {
        return None;
    }

    let topic = &message[open + 1..comma];
    let payload = &message[comma + 1..message.len() - 1];
    if topic.is_empty() {
        return None;
    }

    Some(Instruction::Publish {
        topic: topic.to_string(),
        payload: payload.to_string(),
    })
}
