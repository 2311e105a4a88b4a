// ChatClient: one authenticated user's transport, presence and conversation
// store, wired together and torn down together.

use anyhow::{anyhow, Result};
use log::info;
use std::sync::Arc;

use crate::api::{ChatApi, HttpChatApi};
use crate::chat::store::StoreOptions;
use crate::chat::{ConversationStore, EventSink, LogNotifier, Notifier, PresenceTracker};
use crate::config::ClientConfig;
use crate::models::User;
use crate::transport::{Connector, ReconnectPolicy, SessionState, TransportSession, WebSocketConnector};

pub struct ChatClient {
    local_id: String,
    session: Arc<TransportSession>,
    presence: PresenceTracker,
    store: ConversationStore,
}

impl ChatClient {
    pub fn new(
        local_id: &str,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ChatApi>,
        policy: ReconnectPolicy,
        options: StoreOptions,
        sink: EventSink,
    ) -> Self {
        let session = Arc::new(TransportSession::new(connector, policy));
        // Attached before the first connect so the initial broadcast lands.
        let presence = PresenceTracker::attach(&session, sink.clone());
        let store = ConversationStore::new(local_id, session.clone(), api, sink, options);

        ChatClient {
            local_id: local_id.to_string(),
            session,
            presence,
            store,
        }
    }

    /// Resolve the signed-in user over HTTP, then connect the realtime
    /// transport as that user.
    pub async fn connect(config: &ClientConfig, sink: EventSink) -> Result<(Self, User)> {
        let token = config
            .auth_token()
            .ok_or_else(|| anyhow!("No auth token configured; set SPECTRE_TOKEN or save one in the config"))?;
        let api = Arc::new(HttpChatApi::new(&config.server_url, Some(token))?);
        let user = api.current_user().await?;
        info!("Authenticated as {} ({})", user.full_name, user.id);

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(config.sound_enabled));
        let client = ChatClient::new(
            &user.id,
            Arc::new(WebSocketConnector::new(config.socket_url())),
            api,
            config.reconnect_policy(),
            StoreOptions {
                typing_timeout: config.typing_timeout(),
                notifier,
            },
            sink,
        );
        client.start().await?;
        Ok((client, user))
    }

    pub async fn start(&self) -> Result<()> {
        self.session.connect(&self.local_id).await
    }

    /// Close the conversation and release the transport. Safe to repeat.
    pub fn shutdown(&self) {
        self.store.close_conversation();
        self.session.disconnect();
    }

    /// Flip the new-message sound and return the new setting.
    pub fn toggle_sound(&self) -> bool {
        let notifier = self.store.notifier();
        let enabled = !notifier.sound_enabled();
        notifier.set_sound_enabled(enabled);
        enabled
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
