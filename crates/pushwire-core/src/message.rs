//! Queued message type.
//!
//! A [`Message`] is what a Comet client holds while it has no response
//! stream to write to.

use std::sync::Arc;

use crate::payload::Payload;

/// An immutable (topic, payload) pair awaiting delivery.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the payload was published on.
    pub topic: String,
    /// Shared payload; the same instance is queued for every subscriber.
    pub payload: Arc<Payload>,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Arc<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_shares_payload() {
        let payload = Arc::new(Payload::new("AAPL"));
        let a = Message::new("AAPL", Arc::clone(&payload));
        let b = Message::new("AAPL", Arc::clone(&payload));

        assert_eq!(a.topic, "AAPL");
        assert!(Arc::ptr_eq(&a.payload, &b.payload));
        assert_eq!(Arc::strong_count(&payload), 3);
    }
}
