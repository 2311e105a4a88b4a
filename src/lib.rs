// spectre-chat: client-side sync engine for two-party realtime chat.
pub mod api;
pub mod chat;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod transport;
pub mod utils;

// Re-export main types for convenience
pub use api::{ChatApi, HttpChatApi};
pub use chat::{ChatEvent, ConversationStore, EventSink};
pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ChatError, ChatResult};
pub use models::*;
pub use transport::{SessionState, TransportSession};
