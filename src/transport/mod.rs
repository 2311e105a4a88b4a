// Transport session: one persistent event connection per authenticated identity.
// The session owns the handler registry, so subscriptions outlive individual
// links and survive reconnects. The underlying link comes from a `Connector`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub mod memory;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryHub};
pub use websocket::WebSocketConnector;

/// One event on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Envelope {
            event: event.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Both halves of an open connection. Dropping `outbound` closes the link;
/// `inbound` ends when the remote side goes away.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link for `identity`. Returning `Ok` is the transport ack.
    async fn open(&self, identity: &str) -> Result<Link>;
}

/// Retry schedule used after an established connection drops.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        ReconnectPolicy {
            max_attempts: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Exponential backoff with up to 250ms of jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        exp + jitter
    }
}

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct HandlerRegistry {
    next_token: u64,
    handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

struct Connection {
    identity: Option<String>,
    state: SessionState,
    // Bumped on every connect/disconnect; work started under an older
    // generation must not touch the connection.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Connection {
    fn reset(&mut self) {
        self.generation += 1;
        self.outbound = None;
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

struct SessionShared {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    connection: Mutex<Connection>,
    registry: Mutex<HandlerRegistry>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionShared {
    fn set_state(&self, conn: &mut Connection, state: SessionState) {
        if conn.state != state {
            debug!("Transport state {:?} -> {:?}", conn.state, state);
            conn.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Open a link under `generation`. Returns `Ok(None)` if a later
    /// connect or disconnect superseded this attempt while it was in flight.
    async fn open_link(&self, generation: u64) -> Result<Option<mpsc::UnboundedReceiver<Envelope>>> {
        let identity = {
            let mut conn = lock(&self.connection);
            if conn.generation != generation {
                return Ok(None);
            }
            let identity = conn
                .identity
                .clone()
                .ok_or_else(|| anyhow!("No identity to connect as"))?;
            self.set_state(&mut conn, SessionState::Connecting);
            identity
        };

        let link = match self.connector.open(&identity).await {
            Ok(link) => link,
            Err(e) => {
                let mut conn = lock(&self.connection);
                if conn.generation == generation {
                    self.set_state(&mut conn, SessionState::Disconnected);
                }
                return Err(e);
            }
        };

        let mut conn = lock(&self.connection);
        if conn.generation != generation {
            debug!("Discarding link opened for a superseded connection");
            return Ok(None);
        }
        conn.outbound = Some(link.outbound);
        self.set_state(&mut conn, SessionState::Connected);
        info!("Transport connected as {}", identity);
        Ok(Some(link.inbound))
    }

    /// Drives one connection: dispatches inbound events in arrival order and
    /// runs the retry schedule when the link drops.
    async fn supervise(self: Arc<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            while let Some(envelope) = inbound.recv().await {
                self.dispatch(&envelope);
            }

            if !self.connection_lost(generation) {
                return;
            }

            match self.reconnect(generation).await {
                Some(next) => inbound = next,
                None => return,
            }
        }
    }

    fn connection_lost(&self, generation: u64) -> bool {
        let mut conn = lock(&self.connection);
        if conn.generation != generation {
            return false;
        }
        warn!("Transport connection lost for {:?}", conn.identity);
        conn.outbound = None;
        self.set_state(&mut conn, SessionState::Disconnected);
        true
    }

    async fn reconnect(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        for attempt in 1..=self.policy.max_attempts {
            let backoff = self.policy.backoff(attempt);
            info!(
                "Reconnecting transport in {:?} (attempt {}/{})",
                backoff, attempt, self.policy.max_attempts
            );
            tokio::time::sleep(backoff).await;

            match self.open_link(generation).await {
                Ok(Some(inbound)) => return Some(inbound),
                Ok(None) => return None,
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        if self.policy.max_attempts > 0 {
            error!("Giving up on transport after {} attempts", self.policy.max_attempts);
        }
        None
    }

    fn dispatch(&self, envelope: &Envelope) {
        // Clone the handler list so handlers run without the registry lock and
        // may subscribe, unsubscribe or publish themselves.
        let handlers: Vec<EventHandler> = {
            let registry = lock(&self.registry);
            registry
                .handlers
                .get(&envelope.event)
                .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!("No handler for '{}' event", envelope.event);
            return;
        }
        for handler in handlers {
            handler(&envelope.data);
        }
    }

    fn remove_handler(&self, event: &str, token: u64) {
        let mut registry = lock(&self.registry);
        if let Some(entries) = registry.handlers.get_mut(event) {
            entries.retain(|(t, _)| *t != token);
            if entries.is_empty() {
                registry.handlers.remove(event);
            }
        }
    }
}

/// Unsubscribe handle returned by [`TransportSession::subscribe`].
/// Dropping it also removes the handler.
pub struct Subscription {
    event: String,
    token: u64,
    shared: Weak<SessionShared>,
    active: bool,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_handler(&self.event, self.token);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("token", &self.token)
            .field("active", &self.active)
            .finish()
    }
}

pub struct TransportSession {
    shared: Arc<SessionShared>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        TransportSession {
            shared: Arc::new(SessionShared {
                connector,
                policy,
                connection: Mutex::new(Connection {
                    identity: None,
                    state: SessionState::Disconnected,
                    generation: 0,
                    outbound: None,
                    supervisor: None,
                }),
                registry: Mutex::new(HandlerRegistry::default()),
                state_tx,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.connection).state
    }

    pub fn identity(&self) -> Option<String> {
        lock(&self.shared.connection).identity.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Establish the connection for `identity`. A second call while
    /// connecting or connected as the same identity is a no-op.
    pub async fn connect(&self, identity: &str) -> Result<()> {
        let generation = {
            let mut conn = lock(&self.shared.connection);
            if conn.identity.as_deref() == Some(identity) && conn.state != SessionState::Disconnected {
                debug!("Transport already {:?} as {}", conn.state, identity);
                return Ok(());
            }
            if conn.state != SessionState::Disconnected {
                info!("Switching transport identity from {:?} to {}", conn.identity, identity);
                self.shared.set_state(&mut conn, SessionState::Disconnected);
            }
            conn.reset();
            conn.identity = Some(identity.to_string());
            conn.generation
        };

        info!("Connecting transport as {}", identity);
        let inbound = match self.shared.open_link(generation).await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!("Failed to connect transport as {}: {}", identity, e);
                return Err(e);
            }
        };

        let task = tokio::spawn(Arc::clone(&self.shared).supervise(generation, inbound));
        let mut conn = lock(&self.shared.connection);
        if conn.generation == generation {
            conn.supervisor = Some(task);
        } else {
            task.abort();
        }
        Ok(())
    }

    /// Tear the connection down. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        let mut conn = lock(&self.shared.connection);
        if conn.state == SessionState::Disconnected && conn.supervisor.is_none() {
            debug!("Transport already disconnected");
            conn.identity = None;
            return;
        }
        info!("Disconnecting transport for {:?}", conn.identity);
        conn.reset();
        conn.identity = None;
        self.shared.set_state(&mut conn, SessionState::Disconnected);
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.shared.registry);
        registry.next_token += 1;
        let token = registry.next_token;
        registry
            .handlers
            .entry(event.to_string())
            .or_default()
            .push((token, Arc::new(handler)));
        debug!("Subscribed to '{}' (token {})", event, token);

        Subscription {
            event: event.to_string(),
            token,
            shared: Arc::downgrade(&self.shared),
            active: true,
        }
    }

    /// Number of live handlers for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        lock(&self.shared.registry)
            .handlers
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Send an event. Dropped with a warning when not connected.
    pub fn publish<T: Serialize + ?Sized>(&self, event: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode '{}' payload: {}", event, e);
                return;
            }
        };

        let conn = lock(&self.shared.connection);
        match (conn.state, conn.outbound.as_ref()) {
            (SessionState::Connected, Some(outbound)) => {
                if outbound.send(Envelope::new(event, data)).is_err() {
                    warn!("Transport link closed, dropped '{}' event", event);
                } else {
                    debug!("Published '{}' event", event);
                }
            }
            _ => warn!("Transport not connected, dropped '{}' event", event),
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
