// Conversation store: the client-side cache of the active conversation.
//
// Holds the message sequence for one counterpart at a time, applies optimistic
// sends and rolls them back, and owns the transport subscriptions of the open
// conversation. Each activation bumps an epoch; handlers and in-flight sends
// carry the epoch they started under and their writes are dropped once it is
// stale.
//
// Lock order is `subscriptions` then `state`. Neither lock is held across an
// await and handlers only ever take `state`.

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::deletion::DeletionPropagator;
use super::seen_receipts::SeenReceipts;
use super::sink::{ChatEvent, EventSink, LogNotifier, Notifier};
use super::typing::{TypingCoordinator, DEFAULT_TYPING_TIMEOUT};
use super::{decode, events, DeletedNotice, RemoteTyping, SeenReceipt};
use crate::api::ChatApi;
use crate::error::{ChatError, ChatResult};
use crate::models::{ChatPartner, DeliveryState, Message, OutgoingMessage, TypingState, User};
use crate::transport::{lock, Subscription, TransportSession};

pub struct StoreOptions {
    pub typing_timeout: Duration,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            notifier: Arc::new(LogNotifier::new(false)),
        }
    }
}

#[derive(Default)]
struct StoreState {
    active: Option<String>,
    epoch: u64,
    // Latest open request; an older fetch finishing late is discarded.
    open_ticket: u64,
    messages: Vec<Message>,
    loading_messages: bool,
    contacts: Vec<User>,
    chat_partners: Vec<ChatPartner>,
    loading_users: bool,
}

struct StoreInner {
    local_id: String,
    session: Arc<TransportSession>,
    api: Arc<dyn ChatApi>,
    typing: TypingCoordinator,
    receipts: SeenReceipts,
    deletions: DeletionPropagator,
    sink: EventSink,
    notifier: Arc<dyn Notifier>,
    subscriptions: Mutex<Vec<Subscription>>,
    state: Mutex<StoreState>,
}

impl StoreInner {
    fn is_current(&self, epoch: u64) -> bool {
        lock(&self.state).epoch == epoch
    }

    fn messages_changed(&self, counterpart: String, len: usize) {
        self.sink.emit(ChatEvent::MessagesChanged { counterpart, len });
    }

    /// Append a message for the active conversation. `expected_epoch` is set
    /// when the call comes from a conversation handler.
    fn apply_inbound(&self, expected_epoch: Option<u64>, message: Message) -> bool {
        let (counterpart, len) = {
            let mut state = lock(&self.state);
            if expected_epoch.is_some_and(|epoch| epoch != state.epoch) {
                debug!("Dropping message {} from a closed conversation", message.id);
                return false;
            }
            let Some(counterpart) = state.active.clone() else {
                return false;
            };
            if !message.belongs_to(&self.local_id, &counterpart) {
                debug!(
                    "Ignoring message {} ({} -> {}) outside the active conversation",
                    message.id, message.sender_id, message.receiver_id
                );
                return false;
            }
            if state.messages.iter().any(|m| m.id == message.id) {
                debug!("Message {} already present", message.id);
                return false;
            }
            state.messages.push(message.clone());
            (counterpart, state.messages.len())
        };

        if message.sender_id != self.local_id {
            self.typing.on_remote_stop_signal(&message.sender_id);
            self.notifier.notify(&message);
            self.sink.emit(ChatEvent::Incoming(message));
        }
        self.messages_changed(counterpart, len);
        true
    }

    fn apply_seen(&self, expected_epoch: Option<u64>, receipt: &SeenReceipt) -> usize {
        let (counterpart, len, flipped) = {
            let mut state = lock(&self.state);
            if expected_epoch.is_some_and(|epoch| epoch != state.epoch) {
                return 0;
            }
            let flipped = SeenReceipts::apply(&mut state.messages, receipt);
            if flipped == 0 {
                return 0;
            }
            let Some(counterpart) = state.active.clone() else {
                return flipped;
            };
            (counterpart, state.messages.len(), flipped)
        };
        debug!(
            "Marked {} message(s) {} -> {} seen",
            flipped, receipt.sender_id, receipt.receiver_id
        );
        self.messages_changed(counterpart, len);
        flipped
    }

    fn apply_delete(&self, expected_epoch: Option<u64>, message_id: &str) -> bool {
        let (counterpart, len) = {
            let mut state = lock(&self.state);
            if expected_epoch.is_some_and(|epoch| epoch != state.epoch) {
                return false;
            }
            if !DeletionPropagator::apply(&mut state.messages, message_id) {
                return false;
            }
            let Some(counterpart) = state.active.clone() else {
                return true;
            };
            (counterpart, state.messages.len())
        };
        debug!("Removed message {}", message_id);
        self.messages_changed(counterpart, len);
        true
    }

    fn on_remote_typing(&self, epoch: u64, signal: RemoteTyping) {
        if self.is_current(epoch) {
            self.typing.on_remote_typing_signal(&signal.sender_id);
        }
    }

    fn on_remote_stop(&self, epoch: u64, signal: RemoteTyping) {
        if self.is_current(epoch) {
            self.typing.on_remote_stop_signal(&signal.sender_id);
        }
    }
}

// Subscribe a handler that decodes `T` and forwards it to the store while the
// store is alive. The handler holds a weak reference: the session's registry
// must not keep the store alive.
fn conversation_handler<T, F>(inner: &Arc<StoreInner>, event: &'static str, epoch: u64, apply: F) -> Subscription
where
    T: DeserializeOwned + 'static,
    F: Fn(&StoreInner, u64, T) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    inner.session.subscribe(event, move |data| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if let Some(payload) = decode::<T>(event, data) {
            apply(inner.as_ref(), epoch, payload);
        }
    })
}

fn conversation_subscriptions(inner: &Arc<StoreInner>, epoch: u64) -> Vec<Subscription> {
    vec![
        conversation_handler(inner, events::NEW_MESSAGE, epoch, |inner, epoch, message: Message| {
            inner.apply_inbound(Some(epoch), message);
        }),
        conversation_handler(inner, events::USER_TYPING, epoch, StoreInner::on_remote_typing),
        conversation_handler(inner, events::USER_STOP_TYPING, epoch, StoreInner::on_remote_stop),
        conversation_handler(inner, events::MESSAGE_SEEN, epoch, |inner, epoch, receipt: SeenReceipt| {
            inner.apply_seen(Some(epoch), &receipt);
        }),
        conversation_handler(inner, events::MESSAGE_DELETED, epoch, |inner, epoch, notice: DeletedNotice| {
            inner.apply_delete(Some(epoch), &notice.message_id);
        }),
    ]
}

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl ConversationStore {
    pub fn new(
        local_id: &str,
        session: Arc<TransportSession>,
        api: Arc<dyn ChatApi>,
        sink: EventSink,
        options: StoreOptions,
    ) -> Self {
        let typing = TypingCoordinator::new(session.clone(), options.typing_timeout, sink.clone());
        ConversationStore {
            inner: Arc::new(StoreInner {
                local_id: local_id.to_string(),
                receipts: SeenReceipts::new(session.clone()),
                deletions: DeletionPropagator::new(session.clone()),
                session,
                api,
                typing,
                sink,
                notifier: options.notifier,
                subscriptions: Mutex::new(Vec::new()),
                state: Mutex::new(StoreState::default()),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Make `counterpart_id` the active conversation.
    ///
    /// History is fetched first; if that fails nothing changes and the
    /// previous conversation stays open. On success the previous handlers are
    /// removed, the sequence is replaced and the new handlers are registered
    /// in one step, then unseen inbound messages are acknowledged.
    pub async fn open_conversation(&self, counterpart_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let ticket = {
            let mut state = lock(&inner.state);
            state.open_ticket += 1;
            state.loading_messages = true;
            state.open_ticket
        };

        info!("Opening conversation with {}", counterpart_id);
        let mut history = match inner.api.history(counterpart_id).await {
            Ok(history) => history,
            Err(e) => {
                let mut state = lock(&inner.state);
                if state.open_ticket == ticket {
                    state.loading_messages = false;
                }
                drop(state);
                warn!("Failed to load history with {}: {}", counterpart_id, e);
                inner.sink.emit(ChatEvent::Error(format!("Could not load messages: {}", e)));
                return Err(ChatError::HistoryUnavailable {
                    counterpart: counterpart_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        history.sort_by_key(|m| m.created_at);
        let has_unseen = history.iter().any(|m| m.is_unseen_from(counterpart_id));

        let len = {
            let mut subscriptions = lock(&inner.subscriptions);
            let mut state = lock(&inner.state);
            if state.open_ticket != ticket {
                debug!("History for {} arrived after a newer open, discarding", counterpart_id);
                return Ok(());
            }
            for subscription in subscriptions.drain(..) {
                subscription.unsubscribe();
            }
            state.epoch += 1;
            state.active = Some(counterpart_id.to_string());
            state.messages = history;
            state.loading_messages = false;
            *subscriptions = conversation_subscriptions(inner, state.epoch);
            state.messages.len()
        };

        inner.typing.stop_local_typing();
        inner.typing.set_active_counterpart(Some(counterpart_id));
        inner.sink.emit(ChatEvent::ConversationOpened {
            counterpart: counterpart_id.to_string(),
        });
        inner.messages_changed(counterpart_id.to_string(), len);

        if has_unseen {
            inner.receipts.request_mark_seen(counterpart_id, &inner.local_id);
        }
        Ok(())
    }

    /// Deselect the active conversation and drop its handlers.
    pub fn close_conversation(&self) {
        let inner = &self.inner;
        let closed = {
            let mut subscriptions = lock(&inner.subscriptions);
            let mut state = lock(&inner.state);
            for subscription in subscriptions.drain(..) {
                subscription.unsubscribe();
            }
            state.open_ticket += 1;
            state.loading_messages = false;
            state.epoch += 1;
            state.messages.clear();
            state.active.take()
        };

        inner.typing.stop_local_typing();
        inner.typing.set_active_counterpart(None);
        if let Some(counterpart) = closed {
            info!("Closed conversation with {}", counterpart);
            inner.sink.emit(ChatEvent::ConversationClosed);
        }
    }

    /// Send a message to the active counterpart.
    ///
    /// A pending entry is shown right away and replaced by the canonical
    /// message once the backend confirms it. On failure the entry is removed
    /// and returned in `Failed` state inside [`ChatError::SendFailed`].
    pub async fn send_message(&self, text: &str, image: Option<String>) -> ChatResult<Message> {
        let inner = &self.inner;
        let text = text.trim();

        let (counterpart, epoch, pending, len) = {
            let mut state = lock(&inner.state);
            let counterpart = state.active.clone().ok_or(ChatError::NoActiveConversation)?;
            if text.is_empty() && image.is_none() {
                return Err(ChatError::EmptyMessage);
            }
            let pending = Message::pending(&inner.local_id, &counterpart, text, image.clone());
            state.messages.push(pending.clone());
            (counterpart, state.epoch, pending, state.messages.len())
        };
        inner.messages_changed(counterpart.clone(), len);

        let outgoing = OutgoingMessage {
            text: text.to_string(),
            image,
        };
        let result = inner.api.send_message(&counterpart, &outgoing).await;
        inner.typing.stop_local_typing();

        match result {
            Ok(mut canonical) => {
                canonical.delivery_state = DeliveryState::Confirmed;
                if canonical.sender_id.is_empty() {
                    canonical.sender_id = pending.sender_id.clone();
                }
                if canonical.receiver_id.is_empty() {
                    canonical.receiver_id = pending.receiver_id.clone();
                }
                if canonical.image.is_none() {
                    canonical.image = pending.image.clone();
                }
                let len = {
                    let mut state = lock(&inner.state);
                    state.messages.retain(|m| m.id != pending.id);
                    // A reopen of the same counterpart still shows the message.
                    let still_open = state.active.as_deref() == Some(counterpart.as_str())
                        && canonical.belongs_to(&inner.local_id, &counterpart);
                    if state.epoch != epoch && !still_open {
                        debug!(
                            "Conversation with {} closed before {} was confirmed",
                            counterpart, canonical.id
                        );
                        return Ok(canonical);
                    }
                    if !state.messages.iter().any(|m| m.id == canonical.id) {
                        state.messages.push(canonical.clone());
                    }
                    state.messages.len()
                };
                debug!("Message {} confirmed as {}", pending.id, canonical.id);
                inner.messages_changed(counterpart, len);
                Ok(canonical)
            }
            Err(e) => {
                let len = {
                    let mut state = lock(&inner.state);
                    state.messages.retain(|m| m.id != pending.id);
                    (state.epoch == epoch).then(|| state.messages.len())
                };
                warn!("Failed to send message to {}: {}", counterpart, e);
                if let Some(len) = len {
                    inner.messages_changed(counterpart, len);
                }
                inner.sink.emit(ChatEvent::Error(format!("Failed to send message: {}", e)));

                let mut failed = pending;
                failed.delivery_state = DeliveryState::Failed;
                Err(ChatError::SendFailed {
                    message: Box::new(failed),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Ask the server to mark the counterpart's messages as read. The local
    /// flags change when the `message-seen` broadcast comes back.
    pub fn mark_seen(&self) -> ChatResult<()> {
        let counterpart = self.active_conversation().ok_or(ChatError::NoActiveConversation)?;
        self.inner.receipts.request_mark_seen(&counterpart, &self.inner.local_id);
        Ok(())
    }

    /// Remove a message locally and ask the server to delete it for both
    /// sides. Unknown ids are ignored.
    pub fn delete_message(&self, message_id: &str) -> ChatResult<()> {
        let inner = &self.inner;
        let (removed, counterpart, len) = {
            let mut state = lock(&inner.state);
            let Some(index) = state.messages.iter().position(|m| m.id == message_id) else {
                debug!("Delete of unknown message {} ignored", message_id);
                return Ok(());
            };
            if state.messages[index].is_pending() {
                return Err(ChatError::MessagePending(message_id.to_string()));
            }
            let removed = state.messages.remove(index);
            (removed, state.active.clone(), state.messages.len())
        };

        inner
            .deletions
            .request_delete(&removed.id, &removed.sender_id, &removed.receiver_id);
        if let Some(counterpart) = counterpart {
            inner.messages_changed(counterpart, len);
        }
        Ok(())
    }

    /// Append `message` if it belongs to the active conversation.
    /// Returns whether it was appended.
    pub fn receive_inbound(&self, message: Message) -> bool {
        self.inner.apply_inbound(None, message)
    }

    /// Apply a `message-seen` broadcast. Returns how many flags flipped.
    pub fn on_seen_broadcast(&self, receipt: &SeenReceipt) -> usize {
        self.inner.apply_seen(None, receipt)
    }

    /// Apply a `message-deleted` broadcast. Returns whether anything was removed.
    pub fn on_delete_broadcast(&self, message_id: &str) -> bool {
        self.inner.apply_delete(None, message_id)
    }

    pub async fn load_contacts(&self) -> ChatResult<Vec<User>> {
        let inner = &self.inner;
        lock(&inner.state).loading_users = true;
        let result = inner.api.contacts().await;

        let mut state = lock(&inner.state);
        state.loading_users = false;
        match result {
            Ok(contacts) => {
                state.contacts = contacts.clone();
                drop(state);
                debug!("Loaded {} contacts", contacts.len());
                inner.sink.emit(ChatEvent::ContactsLoaded(contacts.len()));
                Ok(contacts)
            }
            Err(e) => {
                drop(state);
                warn!("Failed to load contacts: {}", e);
                inner.sink.emit(ChatEvent::Error(format!("Could not load contacts: {}", e)));
                Err(ChatError::Request(e))
            }
        }
    }

    pub async fn load_chat_partners(&self) -> ChatResult<Vec<ChatPartner>> {
        let inner = &self.inner;
        lock(&inner.state).loading_users = true;
        let result = inner.api.chat_partners().await;

        let mut state = lock(&inner.state);
        state.loading_users = false;
        match result {
            Ok(partners) => {
                state.chat_partners = partners.clone();
                drop(state);
                debug!("Loaded {} chat partners", partners.len());
                inner.sink.emit(ChatEvent::ChatPartnersLoaded(partners.len()));
                Ok(partners)
            }
            Err(e) => {
                drop(state);
                warn!("Failed to load chats: {}", e);
                inner.sink.emit(ChatEvent::Error(format!("Could not load chats: {}", e)));
                Err(ChatError::Request(e))
            }
        }
    }

    /// Feed the message input's length after every edit.
    pub fn on_local_text_change(&self, current_len: usize) {
        if let Some(counterpart) = self.active_conversation() {
            self.inner.typing.on_local_text_change(&counterpart, current_len);
        }
    }

    pub fn on_input_blur(&self) {
        self.inner.typing.on_input_blur();
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.inner.typing
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.inner.state).messages.clone()
    }

    pub fn active_conversation(&self) -> Option<String> {
        lock(&self.inner.state).active.clone()
    }

    pub fn contacts(&self) -> Vec<User> {
        lock(&self.inner.state).contacts.clone()
    }

    pub fn chat_partners(&self) -> Vec<ChatPartner> {
        lock(&self.inner.state).chat_partners.clone()
    }

    pub fn typing_state(&self) -> TypingState {
        self.inner.typing.typing_state()
    }

    pub fn is_loading_messages(&self) -> bool {
        lock(&self.inner.state).loading_messages
    }

    pub fn is_loading_users(&self) -> bool {
        lock(&self.inner.state).loading_users
    }
}
