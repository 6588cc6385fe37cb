//! Finding "the code" a user is talking about.
//!
//! Looked for, in order, in the message's text (a fenced block if present,
//! otherwise the whole text), a small text attachment, and then the same
//! places in the replied-to message, following reply links at most
//! [`MAX_REPLY_DEPTH`] hops.

use std::path::Path;

use super::transport::{Attachment, InboundMessage};
use crate::agent::heuristics::first_fenced_block;

pub const MAX_REPLY_DEPTH: usize = 3;
pub const MAX_ATTACHMENT_BYTES: usize = 256 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "ts", "jsx", "tsx", "java", "c", "h", "cpp", "hpp", "cc", "go", "rb", "php",
    "cs", "kt", "swift", "sh", "sql", "html", "css", "json", "yaml", "yml", "toml", "xml", "md",
    "txt",
];

fn is_text_attachment(attachment: &Attachment) -> bool {
    let by_mime = attachment
        .mime_type
        .as_deref()
        .map(|m| m.starts_with("text/") || m == "application/json" || m.contains("script"))
        .unwrap_or(false);
    let by_extension = Path::new(&attachment.file_name)
        .extension()
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_string_lossy().to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    by_mime || by_extension
}

fn code_from_attachment(attachment: &Attachment) -> Option<String> {
    if attachment.content.len() > MAX_ATTACHMENT_BYTES || !is_text_attachment(attachment) {
        return None;
    }
    let text = std::str::from_utf8(&attachment.content).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Code in free text: the first fenced block, else the text between the
/// first pair of fences, else the whole text.
pub fn code_from_text(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(block) = first_fenced_block(text) {
        return Some(block);
    }
    let mut parts = text.split("```");
    if let (Some(_), Some(inner), Some(_)) = (parts.next(), parts.next(), parts.next()) {
        let inner = inner.trim();
        if !inner.is_empty() {
            return Some(inner.to_string());
        }
    }
    Some(text.to_string())
}

fn code_from_message(message: &InboundMessage) -> Option<String> {
    message
        .text
        .as_deref()
        .and_then(code_from_text)
        .or_else(|| message.attachment.as_ref().and_then(code_from_attachment))
}

pub fn extract_code(message: &InboundMessage) -> Option<String> {
    let mut current = Some(message);
    for _ in 0..=MAX_REPLY_DEPTH {
        let message = current?;
        if let Some(code) = code_from_message(message) {
            return Some(code);
        }
        current = message.reply_to.as_deref();
    }
    None
}
