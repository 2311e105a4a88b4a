// Data model shared by the store, the transport handlers and the HTTP client.
// Field names follow the backend's camelCase JSON schema; `_id` is the
// canonical identifier on every persisted document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Prefix carried by every locally generated message id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Lifecycle of a message in the local sequence.
///
/// Only `Confirmed` messages come from the backend. `Pending` entries are
/// optimistic placeholders and `Failed` is reported back to the caller when
/// a send is rolled back; it never stays in the sequence.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum DeliveryState {
    Pending,
    #[default]
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    // Send responses may omit the participants; the store fills them in.
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub receiver_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "seen_flag")]
    pub seen: bool,
    #[serde(skip)]
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Build an optimistic entry with a fresh temporary id.
    pub fn pending(sender_id: &str, receiver_id: &str, text: &str, image: Option<String>) -> Self {
        Message {
            id: format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            text: text.to_string(),
            image,
            created_at: Utc::now(),
            seen: false,
            delivery_state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery_state == DeliveryState::Pending
    }

    /// True when the message travels between `local_id` and `counterpart_id`,
    /// in either direction.
    pub fn belongs_to(&self, local_id: &str, counterpart_id: &str) -> bool {
        (self.sender_id == counterpart_id && self.receiver_id == local_id)
            || (self.sender_id == local_id && self.receiver_id == counterpart_id)
    }

    /// True for messages the counterpart sent that the local user has not read.
    pub fn is_unseen_from(&self, counterpart_id: &str) -> bool {
        self.sender_id == counterpart_id && !self.seen
    }
}

pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

// The backend has been seen to send `seen: null` on fresh documents.
fn seen_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Body of a send request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_pic: Option<String>,
}

/// A row of the chat list: someone the local user has exchanged messages with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPartner {
    #[serde(flatten)]
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Remote typing indicator for the active conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingState {
    pub is_typing: bool,
    pub typing_user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seen_normalization() {
        let missing: Message = serde_json::from_value(json!({
            "_id": "m1", "senderId": "u2", "receiverId": "u1", "text": "hi",
            "createdAt": "2024-01-01T10:00:00Z"
        }))
        .unwrap();
        let null: Message = serde_json::from_value(json!({
            "_id": "m2", "senderId": "u2", "receiverId": "u1", "seen": null
        }))
        .unwrap();
        let set: Message = serde_json::from_value(json!({
            "_id": "m3", "senderId": "u2", "receiverId": "u1", "seen": true
        }))
        .unwrap();

        assert!(!missing.seen);
        assert!(!null.seen);
        assert!(set.seen);
        assert_eq!(null.text, "");
        assert_eq!(missing.delivery_state, DeliveryState::Confirmed);
    }

    #[test]
    fn test_delivery_state_is_not_serialized() {
        let msg = Message::pending("u1", "u2", "hello", None);
        let value = serde_json::to_value(&msg).unwrap();

        assert!(value.get("deliveryState").is_none());
        assert!(value.get("delivery_state").is_none());
        assert_eq!(value["senderId"], "u1");
        assert!(value.get("image").is_none());
    }

    #[test]
    fn test_pending_message_has_temporary_id() {
        let a = Message::pending("u1", "u2", "one", None);
        let b = Message::pending("u1", "u2", "two", None);

        assert!(is_temporary_id(&a.id));
        assert!(a.is_pending());
        assert_ne!(a.id, b.id);
        assert!(!is_temporary_id("65a1f0c2e4b0a1b2c3d4e5f6"));
    }

    #[test]
    fn test_belongs_to_checks_both_directions() {
        let inbound = Message::pending("u2", "u1", "x", None);
        let outbound = Message::pending("u1", "u2", "y", None);
        let unrelated = Message::pending("u3", "u1", "z", None);

        assert!(inbound.belongs_to("u1", "u2"));
        assert!(outbound.belongs_to("u1", "u2"));
        assert!(!unrelated.belongs_to("u1", "u2"));
        assert!(inbound.is_unseen_from("u2"));
        assert!(!outbound.is_unseen_from("u2"));
    }

    #[test]
    fn test_chat_partner_flattens_user() {
        let partner: ChatPartner = serde_json::from_value(json!({
            "_id": "u2", "fullName": "Ada", "profilePic": "https://cdn/ada.png",
            "lastMessage": "see you"
        }))
        .unwrap();

        assert_eq!(partner.user.id, "u2");
        assert_eq!(partner.user.full_name, "Ada");
        assert_eq!(partner.user.profile_pic.as_deref(), Some("https://cdn/ada.png"));
        assert_eq!(partner.last_message.as_deref(), Some("see you"));
        assert!(partner.last_message_at.is_none());
    }
}
