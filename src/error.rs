// Errors surfaced by the conversation store to the embedding UI.
// None of these are fatal: every variant leaves the store in a usable state.

use thiserror::Error;

use crate::models::Message;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("no active conversation")]
    NoActiveConversation,

    #[error("message has neither text nor image")]
    EmptyMessage,

    #[error("message {0} is still being sent")]
    MessagePending(String),

    /// The send request failed and the optimistic entry was rolled back.
    /// `message` is the rolled-back entry in `Failed` state.
    #[error("failed to send message: {reason}")]
    SendFailed { message: Box<Message>, reason: String },

    #[error("failed to load conversation with {counterpart}: {reason}")]
    HistoryUnavailable { counterpart: String, reason: String },

    #[error("request failed: {0}")]
    Request(#[from] anyhow::Error),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
