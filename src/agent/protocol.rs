//! Agent CLI JSON event types.
//!
//! With `--format json` the agent writes one JSON record per stdout line. Each
//! record carries a `type`; reasoning-like records hold text either at
//! `text` (type `thinking`) or at `part.text`, plain answer text is a `text`
//! record with `part.text`. Everything else is kept only for diagnostics.

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Records
// ============================================================================

/// Record types the relay cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    Thinking(ThinkingRecord),
    Reasoning(PartRecord),
    StepStart(PartRecord),
    StepFinish(PartRecord),
    Text(PartRecord),

    /// Tool calls, errors and anything newer agents add.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartRecord {
    #[serde(default)]
    pub part: Option<Part>,
}

impl PartRecord {
    fn text(self) -> Option<String> {
        self.part.and_then(|p| p.text)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThinkingRecord {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub part: Option<Part>,
}

// ============================================================================
// Classification
// ============================================================================

/// What a record means for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Reasoning or step progress with non-empty text.
    Thinking(String),
    /// A piece of the final answer.
    Text(String),
    Other,
}

/// A successfully parsed stdout line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub raw: Value,
    pub event: AgentEvent,
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

impl AgentRecord {
    pub fn into_event(self) -> AgentEvent {
        match self {
            AgentRecord::Thinking(record) => {
                let text = non_empty(record.text).or_else(|| record.part.and_then(|p| p.text));
                non_empty(text).map_or(AgentEvent::Other, AgentEvent::Thinking)
            }
            AgentRecord::Reasoning(record)
            | AgentRecord::StepStart(record)
            | AgentRecord::StepFinish(record) => {
                non_empty(record.text()).map_or(AgentEvent::Other, AgentEvent::Thinking)
            }
            AgentRecord::Text(record) => {
                non_empty(record.text()).map_or(AgentEvent::Other, AgentEvent::Text)
            }
            AgentRecord::Unknown => AgentEvent::Other,
        }
    }
}

/// Classify an already parsed record. Records of an unexpected shape are `Other`.
pub fn classify(value: &Value) -> AgentEvent {
    match AgentRecord::deserialize(value) {
        Ok(record) => record.into_event(),
        Err(_) => AgentEvent::Other,
    }
}

/// Parse one stdout line. Blank lines yield `Ok(None)`; lines that are not
/// JSON are an error the caller logs and skips.
pub fn classify_line(line: &str) -> Result<Option<ParsedLine>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let raw: Value = serde_json::from_str(line)?;
    let event = classify(&raw);
    Ok(Some(ParsedLine { raw, event }))
}
