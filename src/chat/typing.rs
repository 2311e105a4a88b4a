// Typing indicators in both directions.
//
// Outbound signals are edge-triggered: `typing` goes out when the local user
// starts typing, `stop-typing` when the input empties, the inactivity timer
// expires, a send completes or the input loses focus. Every keystroke while
// typing restarts the timer.
//
// Inbound signals only count when they come from the active counterpart, and
// the remote indicator also expires on its own if no further signal arrives.

use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::sink::{ChatEvent, EventSink};
use super::{events, TypingSignal};
use crate::models::TypingState;
use crate::transport::{lock, TransportSession};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Default)]
struct LocalTyping {
    // Counterpart we have an outstanding `typing` signal with.
    target: Option<String>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl LocalTyping {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct RemoteTyping {
    active_counterpart: Option<String>,
    state: TypingState,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl RemoteTyping {
    fn cancel_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Clear the indicator. Returns true if it was showing.
    fn clear(&mut self) -> bool {
        self.cancel_timer();
        let was_typing = self.state.is_typing;
        self.state = TypingState::default();
        was_typing
    }
}

#[derive(Clone)]
pub struct TypingCoordinator {
    session: Arc<TransportSession>,
    timeout: Duration,
    local: Arc<Mutex<LocalTyping>>,
    remote: Arc<Mutex<RemoteTyping>>,
    sink: EventSink,
}

impl TypingCoordinator {
    pub fn new(session: Arc<TransportSession>, timeout: Duration, sink: EventSink) -> Self {
        TypingCoordinator {
            session,
            timeout,
            local: Arc::new(Mutex::new(LocalTyping::default())),
            remote: Arc::new(Mutex::new(RemoteTyping::default())),
            sink,
        }
    }

    fn publish(&self, event: &str, receiver_id: &str) {
        self.session.publish(
            event,
            &TypingSignal {
                receiver_id: receiver_id.to_string(),
            },
        );
    }

    /// Feed every change of the message input's length.
    pub fn on_local_text_change(&self, counterpart_id: &str, current_len: usize) {
        let mut local = lock(&self.local);

        if current_len == 0 {
            local.cancel_timer();
            if let Some(target) = local.target.take() {
                self.publish(events::STOP_TYPING, &target);
            }
            return;
        }

        if local.target.as_deref().is_some_and(|target| target != counterpart_id) {
            if let Some(previous) = local.target.take() {
                self.publish(events::STOP_TYPING, &previous);
            }
        }
        if local.target.is_none() {
            debug!("Started typing to {}", counterpart_id);
            self.publish(events::TYPING, counterpart_id);
            local.target = Some(counterpart_id.to_string());
        }

        local.cancel_timer();
        let generation = local.generation;
        let state = self.local.clone();
        let session = self.session.clone();
        let timeout = self.timeout;
        local.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut local = lock(&state);
            if local.generation != generation {
                return;
            }
            local.timer = None;
            if let Some(target) = local.target.take() {
                debug!("Typing to {} went idle", target);
                session.publish(
                    events::STOP_TYPING,
                    &TypingSignal { receiver_id: target },
                );
            }
        }));
    }

    /// Send `stop-typing` now if a `typing` signal is outstanding.
    pub fn stop_local_typing(&self) {
        let mut local = lock(&self.local);
        local.cancel_timer();
        if let Some(target) = local.target.take() {
            self.publish(events::STOP_TYPING, &target);
        }
    }

    pub fn on_input_blur(&self) {
        self.stop_local_typing();
    }

    pub fn is_local_typing(&self) -> bool {
        lock(&self.local).target.is_some()
    }

    /// Point the remote indicator at a new conversation, clearing whatever
    /// the previous one left behind.
    pub fn set_active_counterpart(&self, counterpart_id: Option<&str>) {
        let mut remote = lock(&self.remote);
        remote.active_counterpart = counterpart_id.map(str::to_string);
        if remote.clear() {
            self.sink.emit(ChatEvent::TypingChanged(TypingState::default()));
        }
    }

    pub fn on_remote_typing_signal(&self, sender_id: &str) {
        let mut remote = lock(&self.remote);
        if remote.active_counterpart.as_deref() != Some(sender_id) {
            debug!("Ignoring typing signal from inactive conversation {}", sender_id);
            return;
        }

        let changed = !remote.state.is_typing;
        remote.state = TypingState {
            is_typing: true,
            typing_user_id: Some(sender_id.to_string()),
        };

        remote.cancel_timer();
        let generation = remote.generation;
        let state = self.remote.clone();
        let sink = self.sink.clone();
        let timeout = self.timeout;
        remote.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut remote = lock(&state);
            if remote.generation != generation {
                return;
            }
            remote.timer = None;
            remote.state = TypingState::default();
            sink.emit(ChatEvent::TypingChanged(TypingState::default()));
        }));

        if changed {
            self.sink.emit(ChatEvent::TypingChanged(remote.state.clone()));
        }
    }

    pub fn on_remote_stop_signal(&self, sender_id: &str) {
        let mut remote = lock(&self.remote);
        if remote.active_counterpart.as_deref() != Some(sender_id) {
            debug!("Ignoring stop-typing signal from inactive conversation {}", sender_id);
            return;
        }
        if remote.clear() {
            self.sink.emit(ChatEvent::TypingChanged(TypingState::default()));
        }
    }

    pub fn typing_state(&self) -> TypingState {
        lock(&self.remote).state.clone()
    }
}
