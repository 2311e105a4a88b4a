// Realtime chat synchronization for spectre-chat.
// Entry point for the components that sit on top of the transport session,
// one file per concern: presence, typing, seen receipts, deletion, and the
// conversation store that wires them together.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod deletion;
pub mod presence;
pub mod seen_receipts;
pub mod sink;
pub mod store;
pub mod typing;

pub use deletion::DeletionPropagator;
pub use presence::PresenceTracker;
pub use seen_receipts::SeenReceipts;
pub use sink::{ChatEvent, EventSink, LogNotifier, Notifier};
pub use store::ConversationStore;
pub use typing::TypingCoordinator;

// Event names on the realtime transport
pub mod events {
    pub const NEW_MESSAGE: &str = "new-message";
    pub const TYPING: &str = "typing";
    pub const STOP_TYPING: &str = "stop-typing";
    pub const USER_TYPING: &str = "user-typing";
    pub const USER_STOP_TYPING: &str = "user-stop-typing";
    pub const MARK_SEEN: &str = "mark-seen";
    pub const MESSAGE_SEEN: &str = "message-seen";
    pub const DELETE_MESSAGE: &str = "delete-message";
    pub const MESSAGE_DELETED: &str = "message-deleted";
    pub const ONLINE_USERS: &str = "online-users";
}

/// Outbound `typing` / `stop-typing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub receiver_id: String,
}

/// Inbound `user-typing` / `user-stop-typing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTyping {
    pub sender_id: String,
}

/// `mark-seen` out, `message-seen` in: every message from `sender_id` to
/// `receiver_id` has been read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenReceipt {
    pub sender_id: String,
    pub receiver_id: String,
}

/// Outbound `delete-message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
}

/// Inbound `message-deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedNotice {
    pub message_id: String,
}

/// Inbound `online-users`, either `{ids: [..]}` or a bare array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OnlineUsers {
    Wrapped { ids: Vec<String> },
    Bare(Vec<String>),
}

impl OnlineUsers {
    pub fn into_ids(self) -> Vec<String> {
        match self {
            OnlineUsers::Wrapped { ids } => ids,
            OnlineUsers::Bare(ids) => ids,
        }
    }
}

/// Decode an inbound payload, logging and discarding anything malformed.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(event: &str, data: &Value) -> Option<T> {
    match T::deserialize(data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            log::debug!("Discarding malformed '{}' payload: {}", event, e);
            None
        }
    }
}
