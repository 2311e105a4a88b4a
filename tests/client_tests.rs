// Client lifecycle tests
// Connecting, presence, contact lists and tearing the client down again.

mod common;
use common::{ids, message, settle, user, Harness, LOCAL};

use serde_json::json;

use spectre_chat::chat::{events, Notifier};
use spectre_chat::models::ChatPartner;
use spectre_chat::{ChatEvent, SessionState};

#[tokio::test]
async fn test_start_connects_once() {
    let harness = Harness::new();
    assert_eq!(harness.client.state(), SessionState::Disconnected);

    harness.client.start().await.unwrap();
    harness.client.start().await.unwrap();

    assert_eq!(harness.client.state(), SessionState::Connected);
    assert_eq!(harness.hub.open_count(LOCAL), 1);
}

#[tokio::test]
async fn test_presence_broadcast_replaces_online_set() {
    let mut harness = Harness::connected().await;

    harness.server_emits(events::ONLINE_USERS, json!({"ids": ["u2", "u3"]})).await;
    harness.server_emits(events::ONLINE_USERS, json!(["u3", LOCAL])).await;

    let presence = harness.client.presence();
    assert!(!presence.is_online("u2"));
    assert_eq!(presence.online_users(), ids(&["u1", "u3"]));
    let changes: Vec<ChatEvent> = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ChatEvent::PresenceChanged(_)))
        .collect();
    assert_eq!(changes.len(), 2);
}

#[tokio::test]
async fn test_presence_is_kept_after_disconnect() {
    let harness = Harness::connected().await;
    harness.server_emits(events::ONLINE_USERS, json!(["u2"])).await;

    harness.client.shutdown();

    assert_eq!(harness.client.state(), SessionState::Disconnected);
    assert!(harness.client.presence().is_online("u2"));
}

#[tokio::test]
async fn test_shutdown_releases_transport() {
    let harness = Harness::connected().await;
    harness.api.set_history("u2", vec![]);
    harness.client.store().open_conversation("u2").await.unwrap();

    harness.client.shutdown();
    harness.client.shutdown();
    settle().await;

    assert_eq!(harness.client.state(), SessionState::Disconnected);
    assert!(harness.client.store().active_conversation().is_none());
    assert!(!harness.hub.is_connected(LOCAL));
}

#[tokio::test]
async fn test_dropping_client_disconnects() {
    let harness = Harness::connected().await;
    let hub = harness.hub.clone();

    drop(harness);
    settle().await;

    assert!(!hub.is_connected(LOCAL));
}

#[tokio::test]
async fn test_network_loss_makes_publish_a_noop() {
    let harness = Harness::connected().await;
    harness
        .api
        .set_history("u2", vec![message("m1", LOCAL, "u2", "hi", false)]);
    harness.client.store().open_conversation("u2").await.unwrap();

    harness.hub.drop_client(LOCAL);
    settle().await;
    assert_eq!(harness.client.state(), SessionState::Disconnected);

    harness.client.store().delete_message("m1").unwrap();
    assert!(harness.client.store().messages().is_empty());
    assert!(harness.hub.published_events(events::DELETE_MESSAGE).is_empty());
}

#[tokio::test]
async fn test_contact_lists_load_and_keep_on_failure() {
    let mut harness = Harness::connected().await;
    let store = harness.client.store().clone();
    harness.api.set_contacts(Some(vec![user("u2", "Ada"), user("u3", "Grace")]));
    harness.api.set_partners(Some(vec![ChatPartner {
        user: user("u2", "Ada"),
        last_message: Some("see you".to_string()),
        last_message_at: None,
    }]));

    assert_eq!(store.load_contacts().await.unwrap().len(), 2);
    assert_eq!(store.load_chat_partners().await.unwrap().len(), 1);

    harness.api.set_contacts(None);
    assert!(store.load_contacts().await.is_err());

    assert_eq!(store.contacts().len(), 2);
    assert_eq!(store.chat_partners()[0].user.full_name, "Ada");
    assert!(!store.is_loading_users());
    let events = harness.drain_events();
    assert!(events.contains(&ChatEvent::ContactsLoaded(2)));
    assert!(events.contains(&ChatEvent::ChatPartnersLoaded(1)));
    assert!(events.iter().any(|e| matches!(e, ChatEvent::Error(_))));
}

#[tokio::test]
async fn test_toggle_sound() {
    let harness = Harness::new();

    assert!(harness.client.toggle_sound());
    assert!(harness.notifier.sound_enabled());
    assert!(!harness.client.toggle_sound());
}
