// Read receipts, keyed by (sender, receiver).
// Marking is never applied locally on request; the `message-seen` echo is the
// single source of truth for the seen flag.

use log::debug;
use std::sync::Arc;

use super::{events, SeenReceipt};
use crate::models::Message;
use crate::transport::TransportSession;

#[derive(Clone)]
pub struct SeenReceipts {
    session: Arc<TransportSession>,
}

impl SeenReceipts {
    pub fn new(session: Arc<TransportSession>) -> Self {
        SeenReceipts { session }
    }

    /// Tell the server that everything `counterpart_id` sent to `local_id`
    /// has been read. Repeating the request is harmless.
    pub fn request_mark_seen(&self, counterpart_id: &str, local_id: &str) {
        debug!("Requesting seen receipt for {} -> {}", counterpart_id, local_id);
        self.session.publish(
            events::MARK_SEEN,
            &SeenReceipt {
                sender_id: counterpart_id.to_string(),
                receiver_id: local_id.to_string(),
            },
        );
    }

    /// Mark every message with exactly this (sender, receiver) pair as seen.
    /// Returns how many flags flipped.
    pub fn apply(messages: &mut [Message], receipt: &SeenReceipt) -> usize {
        let mut flipped = 0;
        for message in messages
            .iter_mut()
            .filter(|m| m.sender_id == receipt.sender_id && m.receiver_id == receipt.receiver_id)
        {
            if !message.seen {
                message.seen = true;
                flipped += 1;
            }
        }
        flipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, from: &str, to: &str) -> Message {
        let mut m = Message::pending(from, to, "text", None);
        m.id = id.to_string();
        m.delivery_state = crate::models::DeliveryState::Confirmed;
        m
    }

    fn receipt(from: &str, to: &str) -> SeenReceipt {
        SeenReceipt {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
        }
    }

    #[test]
    fn test_apply_matches_exact_pair_only() {
        let mut messages = vec![
            message("m1", "u2", "u1"),
            message("m2", "u1", "u2"),
            message("m3", "u3", "u1"),
            message("m4", "u2", "u1"),
        ];

        let flipped = SeenReceipts::apply(&mut messages, &receipt("u2", "u1"));

        assert_eq!(flipped, 2);
        let seen: Vec<&str> = messages.iter().filter(|m| m.seen).map(|m| m.id.as_str()).collect();
        assert_eq!(seen, vec!["m1", "m4"]);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let mut messages = vec![message("m1", "u2", "u1"), message("m2", "u2", "u1")];

        SeenReceipts::apply(&mut messages, &receipt("u2", "u1"));
        let once = messages.clone();
        let flipped = SeenReceipts::apply(&mut messages, &receipt("u2", "u1"));

        assert_eq!(flipped, 0);
        assert_eq!(messages, once);
    }
}
