// Outlets from the sync engine to the embedding UI: a bounded event channel
// and the new-message notifier (sound / desktop notification).

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::models::{Message, TypingState};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ConversationOpened { counterpart: String },
    ConversationClosed,
    /// The active sequence changed; `len` is its new length.
    MessagesChanged { counterpart: String, len: usize },
    TypingChanged(TypingState),
    PresenceChanged(Vec<String>),
    /// An inbound message from the counterpart was appended.
    Incoming(Message),
    ContactsLoaded(usize),
    ChatPartnersLoaded(usize),
    /// Non-fatal failure worth showing to the user.
    Error(String),
}

/// Cloneable sender half for [`ChatEvent`]s. Never blocks: a full or closed
/// channel drops the event.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<ChatEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ChatEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(_) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("UI event channel full, dropped {:?}", event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("UI event channel closed");
            }
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &Message);
    fn sound_enabled(&self) -> bool;
    fn set_sound_enabled(&self, enabled: bool);
}

/// Logs each notification and rings the terminal bell when sound is on.
pub struct LogNotifier {
    sound: AtomicBool,
}

impl LogNotifier {
    pub fn new(sound_enabled: bool) -> Self {
        LogNotifier {
            sound: AtomicBool::new(sound_enabled),
        }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, message: &Message) {
        info!("New message {} from {}", message.id, message.sender_id);
        if self.sound_enabled() {
            eprint!("\x07");
        }
    }

    fn sound_enabled(&self) -> bool {
        self.sound.load(Ordering::SeqCst)
    }

    fn set_sound_enabled(&self, enabled: bool) {
        self.sound.store(enabled, Ordering::SeqCst);
    }
}
