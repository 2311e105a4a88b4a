// Message deletion.
// The deleting side removes its own copy first and then tells the server; the
// `message-deleted` broadcast may reach the originator too, so removal is a
// filter by id and a missing id is fine.

use log::debug;
use std::sync::Arc;

use super::{events, DeleteRequest};
use crate::models::Message;
use crate::transport::TransportSession;

#[derive(Clone)]
pub struct DeletionPropagator {
    session: Arc<TransportSession>,
}

impl DeletionPropagator {
    pub fn new(session: Arc<TransportSession>) -> Self {
        DeletionPropagator { session }
    }

    pub fn request_delete(&self, message_id: &str, sender_id: &str, receiver_id: &str) {
        debug!("Requesting delete of {}", message_id);
        self.session.publish(
            events::DELETE_MESSAGE,
            &DeleteRequest {
                message_id: message_id.to_string(),
                sender_id: sender_id.to_string(),
                receiver_id: receiver_id.to_string(),
            },
        );
    }

    /// Remove `message_id` from the sequence. Returns whether anything was removed.
    pub fn apply(messages: &mut Vec<Message>, message_id: &str) -> bool {
        let before = messages.len();
        messages.retain(|m| m.id != message_id);
        messages.len() != before
    }
}
