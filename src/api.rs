// Request/response calls to the chat backend.
// The store only depends on the `ChatApi` trait; `HttpChatApi` is the
// reqwest-backed implementation used by the binary.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::models::{ChatPartner, Message, OutgoingMessage, User};

#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Everyone the local user can start a conversation with.
    async fn contacts(&self) -> Result<Vec<User>>;
    /// People the local user has already exchanged messages with.
    async fn chat_partners(&self) -> Result<Vec<ChatPartner>>;
    /// Canonical history with `user_id`, oldest first.
    async fn history(&self, user_id: &str) -> Result<Vec<Message>>;
    /// Create a message; returns the canonical copy.
    async fn send_message(&self, user_id: &str, message: &OutgoingMessage) -> Result<Message>;
    /// The authenticated user behind the configured credentials.
    async fn current_user(&self) -> Result<User>;
}

/// The send endpoint wraps the created message in `data`; older deployments
/// return it bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum SendResponse {
    Wrapped { data: Message },
    Bare(Message),
}

impl SendResponse {
    fn into_message(self) -> Message {
        match self {
            SendResponse::Wrapped { data } => data,
            SendResponse::Bare(message) => message,
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.message,
        Err(_) if body.is_empty() => "no response body".to_string(),
        Err(_) => body.to_string(),
    }
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(server_url: &str, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(HttpChatApi {
            client,
            base_url: api_base(server_url),
            token,
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{}", self.base_url, path)))
    }

    // The backend authenticates with its `jwt` session cookie.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::COOKIE, format!("jwt={}", token)),
            None => request,
        }
    }

    async fn read_json<T: DeserializeOwned>(what: &str, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("{} failed: {}", what, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} failed ({}): {}", what, status, error_message(&body)));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("{} returned an unreadable response: {}", what, e))
    }
}

pub(crate) fn api_base(server_url: &str) -> String {
    format!("{}/api", server_url.trim_end_matches('/'))
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn contacts(&self) -> Result<Vec<User>> {
        debug!("Fetching contacts");
        Self::read_json("Loading contacts", self.get("/messages/contacts")).await
    }

    async fn chat_partners(&self) -> Result<Vec<ChatPartner>> {
        debug!("Fetching chat partners");
        Self::read_json("Loading chats", self.get("/messages/chats")).await
    }

    async fn history(&self, user_id: &str) -> Result<Vec<Message>> {
        debug!("Fetching history with {}", user_id);
        Self::read_json("Loading messages", self.get(&format!("/messages/{}", user_id))).await
    }

    async fn send_message(&self, user_id: &str, message: &OutgoingMessage) -> Result<Message> {
        let response: SendResponse = Self::read_json(
            "Sending message",
            self.post(&format!("/messages/send/{}", user_id)).json(message),
        )
        .await?;
        let created = response.into_message();
        info!("Message {} created for {}", created.id, user_id);
        Ok(created)
    }

    async fn current_user(&self) -> Result<User> {
        Self::read_json("Checking session", self.get("/auth/check")).await
    }
}
