//! Boundary to the chat platform.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

pub use crate::sessions::store::UserId;

pub type ChatId = i64;
pub type MessageId = i64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Message {0} not found")]
    MessageNotFound(MessageId),
}

/// A file attached to an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
}

/// One unit of user input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    /// The message this one replies to.
    pub reply_to: Option<Box<InboundMessage>>,
}

impl InboundMessage {
    pub fn text(user_id: UserId, chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            user_id,
            chat_id,
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePayload {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    pub file_name: String,
    pub caption: String,
    pub payload: FilePayload,
}

/// A selectable option; `data` comes back through the relay's choice handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub label: String,
    pub data: String,
}

impl Choice {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, text: String) -> Result<MessageId, TransportError>;

    async fn send_choices(
        &self,
        chat_id: ChatId,
        text: String,
        choices: Vec<Choice>,
    ) -> Result<MessageId, TransportError>;

    async fn edit_text(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: String,
    ) -> Result<(), TransportError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError>;

    async fn send_file(&self, chat_id: ChatId, file: OutboundFile) -> Result<(), TransportError>;
}
