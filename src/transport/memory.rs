// In-process transport: a hub standing in for the realtime server.
// Everything a client publishes is kept in an outbox that can be inspected
// synchronously; events can be pushed to any connected identity.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{lock, Connector, Envelope, Link};

struct ClientLink {
    to_client: mpsc::UnboundedSender<Envelope>,
    from_client: mpsc::UnboundedReceiver<Envelope>,
}

#[derive(Default)]
struct HubInner {
    links: HashMap<String, ClientLink>,
    outbox: Vec<(String, Envelope)>,
    opens: HashMap<String, usize>,
    refuse: bool,
}

impl HubInner {
    fn drain(&mut self) {
        for (identity, link) in self.links.iter_mut() {
            while let Ok(envelope) = link.from_client.try_recv() {
                self.outbox.push((identity.clone(), envelope));
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent opens fail, as an unreachable server would.
    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.inner).refuse = refuse;
    }

    pub fn open_count(&self, identity: &str) -> usize {
        lock(&self.inner).opens.get(identity).copied().unwrap_or(0)
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        lock(&self.inner)
            .links
            .get(identity)
            .map(|link| !link.to_client.is_closed())
            .unwrap_or(false)
    }

    /// Push an event to one client. Returns false if it is not connected.
    pub fn emit(&self, identity: &str, event: &str, data: Value) -> bool {
        let inner = lock(&self.inner);
        match inner.links.get(identity) {
            Some(link) => link.to_client.send(Envelope::new(event, data)).is_ok(),
            None => {
                debug!("Hub has no link for {}, dropped '{}'", identity, event);
                false
            }
        }
    }

    /// Push an event to every connected client.
    pub fn broadcast(&self, event: &str, data: Value) {
        let inner = lock(&self.inner);
        for link in inner.links.values() {
            let _ = link.to_client.send(Envelope::new(event, data.clone()));
        }
    }

    /// Sever a client's link, as a network failure would.
    pub fn drop_client(&self, identity: &str) {
        let mut inner = lock(&self.inner);
        inner.drain();
        inner.links.remove(identity);
    }

    /// Everything published so far, oldest first, with the publishing identity.
    pub fn published(&self) -> Vec<(String, Envelope)> {
        let mut inner = lock(&self.inner);
        inner.drain();
        inner.outbox.clone()
    }

    pub fn published_by(&self, identity: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|(from, _)| from == identity)
            .map(|(_, envelope)| envelope)
            .collect()
    }

    /// Published events named `event`, across all identities.
    pub fn published_events(&self, event: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .map(|(_, envelope)| envelope)
            .filter(|envelope| envelope.event == event)
            .collect()
    }

    pub fn clear_published(&self) {
        let mut inner = lock(&self.inner);
        inner.drain();
        inner.outbox.clear();
    }
}

pub struct MemoryConnector {
    hub: MemoryHub,
}

impl MemoryConnector {
    pub fn new(hub: MemoryHub) -> Self {
        MemoryConnector { hub }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, identity: &str) -> Result<Link> {
        let mut inner = lock(&self.hub.inner);
        if inner.refuse {
            return Err(anyhow!("Connection refused by in-memory hub"));
        }
        inner.drain();

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        inner.links.insert(
            identity.to_string(),
            ClientLink {
                to_client,
                from_client,
            },
        );
        *inner.opens.entry(identity.to_string()).or_default() += 1;

        Ok(Link { outbound, inbound })
    }
}
