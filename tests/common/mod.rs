// Common test utilities for integration tests
// A scriptable in-memory backend API, a notifier that records what it was
// asked to show, and a client wired to the in-memory transport hub.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::LevelFilter;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use spectre_chat::api::ChatApi;
use spectre_chat::chat::store::StoreOptions;
use spectre_chat::chat::{ChatEvent, EventSink, Notifier};
use spectre_chat::models::{ChatPartner, Message, OutgoingMessage, User};
use spectre_chat::transport::{MemoryConnector, MemoryHub, ReconnectPolicy};
use spectre_chat::ChatClient;

pub const LOCAL: &str = "u1";
pub const TYPING_TIMEOUT: Duration = Duration::from_millis(2000);

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Let spawned tasks (transport dispatch, timers that already fired) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// A canonical message as the backend would send it.
pub fn message(id: &str, from: &str, to: &str, text: &str, seen: bool) -> Message {
    serde_json::from_value(json!({
        "_id": id,
        "senderId": from,
        "receiverId": to,
        "text": text,
        "seen": seen,
        "createdAt": "2024-03-01T12:00:00Z",
    }))
    .expect("valid message json")
}

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        full_name: name.to_string(),
        email: None,
        profile_pic: None,
    }
}

pub enum SendScript {
    Confirm(String),
    Fail(String),
}

/// Backend stand-in. Histories, send outcomes and list results are scripted;
/// sends and history fetches can be held until the test releases them.
pub struct MockApi {
    local_id: String,
    histories: Mutex<HashMap<String, Vec<Message>>>,
    history_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    send_script: Mutex<VecDeque<SendScript>>,
    send_gate: Mutex<Option<Arc<Semaphore>>>,
    sent: Mutex<Vec<(String, OutgoingMessage)>>,
    contacts: Mutex<Option<Vec<User>>>,
    partners: Mutex<Option<Vec<ChatPartner>>>,
    next_id: AtomicUsize,
}

impl MockApi {
    pub fn new(local_id: &str) -> Self {
        MockApi {
            local_id: local_id.to_string(),
            histories: Mutex::new(HashMap::new()),
            history_gates: Mutex::new(HashMap::new()),
            send_script: Mutex::new(VecDeque::new()),
            send_gate: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            contacts: Mutex::new(None),
            partners: Mutex::new(None),
            next_id: AtomicUsize::new(100),
        }
    }

    pub fn set_history(&self, counterpart: &str, messages: Vec<Message>) {
        self.histories.lock().unwrap().insert(counterpart.to_string(), messages);
    }

    /// Make history fetches for `counterpart` wait for a permit.
    pub fn hold_history(&self, counterpart: &str) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.history_gates
            .lock()
            .unwrap()
            .insert(counterpart.to_string(), gate.clone());
        gate
    }

    /// Make sends wait for a permit each.
    pub fn hold_sends(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn script_send(&self, script: SendScript) {
        self.send_script.lock().unwrap().push_back(script);
    }

    pub fn set_contacts(&self, contacts: Option<Vec<User>>) {
        *self.contacts.lock().unwrap() = contacts;
    }

    pub fn set_partners(&self, partners: Option<Vec<ChatPartner>>) {
        *self.partners.lock().unwrap() = partners;
    }

    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        if let Ok(permit) = gate.acquire().await {
            permit.forget();
        }
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn contacts(&self) -> Result<Vec<User>> {
        let contacts = self.contacts.lock().unwrap().clone();
        contacts.ok_or_else(|| anyhow!("contacts endpoint unavailable"))
    }

    async fn chat_partners(&self) -> Result<Vec<ChatPartner>> {
        let partners = self.partners.lock().unwrap().clone();
        partners.ok_or_else(|| anyhow!("chats endpoint unavailable"))
    }

    async fn history(&self, user_id: &str) -> Result<Vec<Message>> {
        let gate = self.history_gates.lock().unwrap().get(user_id).cloned();
        pass(gate).await;
        let history = self.histories.lock().unwrap().get(user_id).cloned();
        history.ok_or_else(|| anyhow!("no conversation with {}", user_id))
    }

    async fn send_message(&self, user_id: &str, outgoing: &OutgoingMessage) -> Result<Message> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), outgoing.clone()));
        let gate = self.send_gate.lock().unwrap().clone();
        pass(gate).await;

        let script = self.send_script.lock().unwrap().pop_front();
        let id = match script {
            Some(SendScript::Fail(reason)) => return Err(anyhow!(reason)),
            Some(SendScript::Confirm(id)) => id,
            None => format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        };
        let mut created = message(&id, &self.local_id, user_id, &outgoing.text, false);
        created.image = outgoing.image.clone();
        Ok(created)
    }

    async fn current_user(&self) -> Result<User> {
        Ok(user(&self.local_id, "Local User"))
    }
}

/// Remembers every notification instead of ringing a bell.
#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<String>>,
    sound: AtomicBool,
}

impl RecordingNotifier {
    pub fn notified(&self) -> Vec<String> {
        self.notified.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &Message) {
        self.notified.lock().unwrap().push(message.id.clone());
    }

    fn sound_enabled(&self) -> bool {
        self.sound.load(Ordering::SeqCst)
    }

    fn set_sound_enabled(&self, enabled: bool) {
        self.sound.store(enabled, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub hub: MemoryHub,
    pub api: Arc<MockApi>,
    pub notifier: Arc<RecordingNotifier>,
    pub client: ChatClient,
    pub events: mpsc::Receiver<ChatEvent>,
}

impl Harness {
    /// A client for `LOCAL`, not yet connected.
    pub fn new() -> Self {
        setup_logging();
        let hub = MemoryHub::new();
        let api = Arc::new(MockApi::new(LOCAL));
        let notifier = Arc::new(RecordingNotifier::default());
        let (sink, events) = EventSink::channel(256);
        let client = ChatClient::new(
            LOCAL,
            Arc::new(MemoryConnector::new(hub.clone())),
            api.clone(),
            ReconnectPolicy::disabled(),
            StoreOptions {
                typing_timeout: TYPING_TIMEOUT,
                notifier: notifier.clone(),
            },
            sink,
        );
        Harness {
            hub,
            api,
            notifier,
            client,
            events,
        }
    }

    pub async fn connected() -> Self {
        let harness = Self::new();
        harness.client.start().await.expect("in-memory connect");
        harness
    }

    /// Push an event from the server to the local client and let it dispatch.
    pub async fn server_emits(&self, event: &str, data: serde_json::Value) {
        assert!(self.hub.emit(LOCAL, event, data), "client is not connected");
        settle().await;
    }

    /// Events the engine reported so far.
    pub fn drain_events(&mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.client
            .store()
            .messages()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    pub fn published_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.hub
            .published_events(event)
            .into_iter()
            .map(|envelope| envelope.data)
            .collect()
    }
}

/// A local HTTP backend answering `"<METHOD> <path>"` routes with canned JSON.
/// Unknown routes get a 404 with the backend's `{message}` error body.
pub struct StubBackend {
    pub url: String,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubBackend {
    pub async fn start(routes: Vec<(&str, serde_json::Value)>) -> Self {
        setup_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub backend");
        let url = format!("http://{}", listener.local_addr().expect("stub address"));
        let routes: HashMap<String, String> = routes
            .into_iter()
            .map(|(route, body)| (route.to_string(), body.to_string()))
            .collect();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let Some(route) = read_request(&mut socket).await else {
                    continue;
                };
                seen.lock().unwrap().push(route.clone());
                let (status, body) = match routes.get(&route) {
                    Some(body) => ("200 OK", body.clone()),
                    None => ("404 Not Found", json!({"message": "not found"}).to_string()),
                };
                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        StubBackend { url, requests, task }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// Reads one request (head and body) and returns "<METHOD> <path>".
async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break end;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_len = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + 4 + body_len {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next()?.split_whitespace();
    Some(format!("{} {}", request_line.next()?, request_line.next()?))
}

pub fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn unique(values: &[String]) -> bool {
    values.iter().collect::<HashSet<_>>().len() == values.len()
}
