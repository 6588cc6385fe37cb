//! Core types shared by the agent layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::tracker::FileChanges;

/// Characters of stdout/stderr kept on a result for diagnostics.
pub const RAW_EXCERPT_CHARS: usize = 1000;
/// Characters of stderr quoted back to the user on a failed exit.
pub const ERROR_EXCERPT_CHARS: usize = 200;

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}...", &text[..byte_index]),
        None => text.to_string(),
    }
}

/// Provider/model pair. Empty strings mean "unset".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelSelection {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.provider_id.is_empty() && !self.model_id.is_empty()
    }

    /// Value for the CLI's `-m` flag: `provider/model`, or the bare model when
    /// no provider is known.
    pub fn cli_model_arg(&self) -> Option<String> {
        match (self.provider_id.is_empty(), self.model_id.is_empty()) {
            (false, false) => Some(format!("{}/{}", self.provider_id, self.model_id)),
            (true, false) => Some(self.model_id.clone()),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        if self.is_complete() {
            format!("{}/{}", self.provider_id, self.model_id)
        } else {
            "agent default".to_string()
        }
    }
}

/// One entry of the agent's provider catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Model id -> metadata, in the order the agent reported them.
    #[serde(default)]
    pub models: Map<String, Value>,
}

impl ProviderInfo {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn first_model(&self) -> Option<&str> {
        self.models.keys().next().map(String::as_str)
    }
}

/// Why a provider or model choice was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Provider {0} is not connected")]
    ProviderNotConnected(String),
    #[error("Provider {0} has no models")]
    NoModels(String),
    #[error("Model {model} is not offered by {provider}")]
    UnknownModel { provider: String, model: String },
}

/// `GET /provider` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCatalog {
    #[serde(default)]
    pub all: Vec<ProviderInfo>,
    #[serde(default)]
    pub connected: Vec<String>,
}

impl ProviderCatalog {
    pub fn is_connected(&self, provider_id: &str) -> bool {
        self.connected.iter().any(|id| id == provider_id)
    }

    /// Connected providers, in catalog order.
    pub fn connected_providers(&self) -> Vec<&ProviderInfo> {
        self.all
            .iter()
            .filter(|p| self.is_connected(&p.id))
            .collect()
    }

    /// Look up a provider only if it is connected.
    pub fn usable_provider(&self, provider_id: &str) -> Option<&ProviderInfo> {
        if !self.is_connected(provider_id) {
            return None;
        }
        self.all.iter().find(|p| p.id == provider_id)
    }

    pub fn is_usable(&self, selection: &ModelSelection) -> bool {
        self.usable_provider(&selection.provider_id)
            .map(|p| p.models.contains_key(&selection.model_id))
            .unwrap_or(false)
    }

    /// First connected provider and its first model; empty strings when
    /// nothing is connected.
    pub fn default_selection(&self) -> ModelSelection {
        let Some(provider_id) = self.connected.first() else {
            return ModelSelection::default();
        };
        let model_id = self
            .all
            .iter()
            .find(|p| &p.id == provider_id)
            .and_then(ProviderInfo::first_model)
            .unwrap_or_default();
        ModelSelection::new(provider_id.clone(), model_id)
    }

    /// Choose a provider with its first model.
    pub fn select_provider(&self, provider_id: &str) -> Result<ModelSelection, SelectionError> {
        let provider = self
            .usable_provider(provider_id)
            .ok_or_else(|| SelectionError::ProviderNotConnected(provider_id.to_string()))?;
        let model = provider
            .first_model()
            .ok_or_else(|| SelectionError::NoModels(provider_id.to_string()))?;
        Ok(ModelSelection::new(provider_id, model))
    }

    pub fn select_model(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ModelSelection, SelectionError> {
        let provider = self
            .usable_provider(provider_id)
            .ok_or_else(|| SelectionError::ProviderNotConnected(provider_id.to_string()))?;
        if !provider.models.contains_key(model_id) {
            return Err(SelectionError::UnknownModel {
                provider: provider_id.to_string(),
                model: model_id.to_string(),
            });
        }
        Ok(ModelSelection::new(provider_id, model_id))
    }
}

/// Normalized outcome of one agent invocation.
///
/// `error == true` means `response` holds a readable diagnostic.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvocationResult {
    pub response: String,
    pub thinking: Vec<String>,
    pub events: Vec<Value>,
    pub error: bool,
    /// Session-relative paths of files the agent produced outside the
    /// structured protocol.
    pub moved_files: Vec<String>,
    pub raw_stdout: String,
    pub raw_stderr: String,
}

impl InvocationResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            response: message.into(),
            error: true,
            ..Default::default()
        }
    }
}

/// Result of a coding task: the invocation plus what it did to the session folder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskOutcome {
    pub session_id: String,
    pub session_folder: PathBuf,
    pub invocation: InvocationResult,
    pub files: FileChanges,
}

/// A coding request and how its prompt is assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodingTask {
    Generate { prompt: String },
    Debug { code: String, error: String },
    Refactor { code: String, focus: String },
}

const LABEL_CHARS: usize = 50;

impl CodingTask {
    pub fn prompt(&self) -> String {
        match self {
            CodingTask::Generate { prompt } => prompt.clone(),
            CodingTask::Debug { code, error } => format!(
                "Debug this code. Error: {}\n\nCode:\n```\n{}\n```\n\nReturn the fixed code.",
                error, code
            ),
            CodingTask::Refactor { code, focus } => format!(
                "Refactor this code. Focus: {}\n\nCode:\n```\n{}\n```\n\nReturn the improved version.",
                focus, code
            ),
        }
    }

    /// Title for the transient remote session.
    pub fn session_label(&self) -> String {
        let (prefix, text) = match self {
            CodingTask::Generate { prompt } => ("Code gen: ", prompt),
            CodingTask::Debug { error, .. } => ("Debug: ", error),
            CodingTask::Refactor { focus, .. } => ("Refactor: ", focus),
        };
        let head: String = text.chars().take(LABEL_CHARS).collect();
        format!("{}{}", prefix, head)
    }
}

/// Failures inside the agent layer. Converted to [`InvocationResult`] before
/// leaving the proxy.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent exited with {status}")]
    Exit { status: String, stderr: String },
    #[error("agent API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid agent response: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    /// Text shown to the chat user.
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Timeout(limit) => format!(
                "The agent timed out after {} seconds. The request took too long to complete; \
                 try a smaller task or split it into steps.",
                limit.as_secs()
            ),
            AgentError::Exit { status, stderr } => {
                let detail = if stderr.trim().is_empty() {
                    "no error output".to_string()
                } else {
                    excerpt(stderr.trim(), ERROR_EXCERPT_CHARS)
                };
                format!(
                    "The agent command failed ({}).\n\nError: {}\n\nCheck that the agent CLI is installed and configured.",
                    status, detail
                )
            }
            AgentError::Spawn { command, source } => format!(
                "Could not start the agent command `{}`: {}",
                command, source
            ),
            other => format!(
                "Unexpected error while running the agent: {}",
                excerpt(&other.to_string(), ERROR_EXCERPT_CHARS)
            ),
        }
    }
}
