// Presence tracking from `online-users` broadcasts.
// The server is authoritative: each broadcast replaces the whole set, so users
// who drop without an explicit offline event disappear on the next broadcast.

use log::debug;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::sink::{ChatEvent, EventSink};
use super::{decode, events, OnlineUsers};
use crate::transport::{lock, Subscription, TransportSession};

struct PresenceInner {
    online: Mutex<HashSet<String>>,
    sink: EventSink,
}

impl PresenceInner {
    fn replace(&self, ids: Vec<String>) {
        let snapshot = {
            let mut online = lock(&self.online);
            *online = ids.into_iter().collect();
            debug!("Presence updated: {} online", online.len());
            sorted(&online)
        };
        self.sink.emit(ChatEvent::PresenceChanged(snapshot));
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut ids: Vec<String> = set.iter().cloned().collect();
    ids.sort();
    ids
}

pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
    _subscription: Subscription,
}

impl PresenceTracker {
    /// Subscribe to presence broadcasts. Call before the session connects so
    /// the first broadcast is not missed.
    pub fn attach(session: &TransportSession, sink: EventSink) -> Self {
        let inner = Arc::new(PresenceInner {
            online: Mutex::new(HashSet::new()),
            sink,
        });

        let handler_inner = inner.clone();
        let subscription = session.subscribe(events::ONLINE_USERS, move |data| {
            if let Some(users) = decode::<OnlineUsers>(events::ONLINE_USERS, data) {
                handler_inner.replace(users.into_ids());
            }
        });

        PresenceTracker {
            inner,
            _subscription: subscription,
        }
    }

    pub fn on_presence_broadcast(&self, ids: Vec<String>) {
        self.inner.replace(ids);
    }

    pub fn is_online(&self, id: &str) -> bool {
        lock(&self.inner.online).contains(id)
    }

    /// Online ids, sorted.
    pub fn online_users(&self) -> Vec<String> {
        sorted(&lock(&self.inner.online))
    }
}
