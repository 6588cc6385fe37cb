//! Receivers for thinking events emitted while an invocation is running.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Called once per non-empty thinking block, in emission order, while the
/// agent is still running. Errors are logged by the caller and never abort
/// the invocation.
#[async_trait]
pub trait ThinkingSink: Send + Sync {
    async fn on_thinking(&self, text: &str) -> Result<(), SinkError>;
}

/// Discards everything.
pub struct NoopSink;

#[async_trait]
impl ThinkingSink for NoopSink {
    async fn on_thinking(&self, _text: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards blocks into a channel for a consumer that pulls them.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ThinkingSink for ChannelSink {
    async fn on_thinking(&self, text: &str) -> Result<(), SinkError> {
        self.tx
            .send(text.to_string())
            .map_err(|_| "thinking receiver dropped".into())
    }
}
