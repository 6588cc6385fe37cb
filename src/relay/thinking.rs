//! Forwarding thinking blocks to the chat while a task runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::transport::{ChatId, ChatTransport};
use crate::agent::sink::{SinkError, ThinkingSink};
use crate::agent::types::excerpt;
use crate::sessions::store::{SessionStore, UserId};

/// Longest chat message used for one part, leaving room for the label.
pub const MAX_PART_CHARS: usize = 3500;
/// Blocks arriving faster than this after the last forwarded one are dropped.
pub const MIN_THINKING_INTERVAL: Duration = Duration::from_millis(300);

const SEPARATORS: [&str; 6] = [". ", "! ", "? ", "\n\n", "\n", " "];

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Split into parts of at most `max_chars` characters, cutting after a
/// sentence end, blank line, newline or space when that keeps at least 70% of
/// the limit, and hard-cutting otherwise.
pub fn split_text_into_parts(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut parts = Vec::new();
    let mut rest = text.trim();

    while rest.chars().count() > max_chars {
        let limit = byte_offset(rest, max_chars);
        let window = &rest[..limit];
        let min_keep = max_chars * 7 / 10;
        let split_at = SEPARATORS
            .iter()
            .find_map(|sep| {
                window
                    .rfind(sep)
                    .filter(|&pos| pos > 0 && window[..pos].chars().count() > min_keep)
                    .map(|pos| pos + sep.len())
            })
            .unwrap_or(limit);

        let part = rest[..split_at].trim();
        if !part.is_empty() {
            parts.push(part.to_string());
        }
        rest = rest[split_at..].trim();
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// "Thinking" or, when the part asks something, "Question", numbered when split.
pub fn part_label(part: &str, index: usize, total: usize) -> String {
    let kind = if part.contains('?') { "Question" } else { "Thinking" };
    if total > 1 {
        format!("{} ({}/{})", kind, index + 1, total)
    } else {
        kind.to_string()
    }
}

/// Sends a user's thinking blocks to their chat, honouring their display
/// preference and the minimum interval.
pub struct ThinkingForwarder {
    transport: Arc<dyn ChatTransport>,
    store: Arc<SessionStore>,
    user_id: UserId,
    chat_id: ChatId,
    last_sent: Mutex<Option<Instant>>,
}

impl ThinkingForwarder {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: Arc<SessionStore>,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Self {
        Self {
            transport,
            store,
            user_id,
            chat_id,
            last_sent: Mutex::new(None),
        }
    }

    /// Claim the send slot unless the previous block went out too recently.
    fn claim_slot(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_sent.lock();
        if let Some(previous) = *last {
            if now.duration_since(previous) < MIN_THINKING_INTERVAL {
                return false;
            }
        }
        *last = Some(now);
        true
    }
}

#[async_trait]
impl ThinkingSink for ThinkingForwarder {
    async fn on_thinking(&self, text: &str) -> Result<(), SinkError> {
        let text = text.trim();
        if text.is_empty() || !self.store.get_thinking_preference(self.user_id) {
            return Ok(());
        }
        log::info!("Thinking: {}", excerpt(text, 200));

        if !self.claim_slot() {
            log::debug!("Dropping thinking block inside the minimum interval");
            return Ok(());
        }

        let parts = split_text_into_parts(text, MAX_PART_CHARS);
        let total = parts.len();
        let mut last_error = None;
        for (index, part) in parts.iter().enumerate() {
            let message = format!("{}: {}", part_label(part, index, total), part);
            if let Err(e) = self.transport.send_text(self.chat_id, message).await {
                log::warn!("Failed to send thinking part {}/{}: {}", index + 1, total, e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
