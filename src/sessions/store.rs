//! Per-user sessions and preferences.
//!
//! The store is the single owner of "which session is active" and "which
//! provider/model does this user want". All state sits behind one lock, so a
//! reader never sees a session without its folder or half a preference update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::files::{ensure_session_folder, SessionFileError};
use crate::agent::types::ModelSelection;

pub type UserId = i64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create session folder: {0}")]
    Folder(#[from] SessionFileError),
    #[error("Session folder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Source of the default provider/model when a user has not chosen one.
#[async_trait]
pub trait DefaultProvider: Send + Sync {
    async fn default_selection(&self) -> ModelSelection;
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: String, // "user" or "assistant"
    pub content: String,
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: role.to_string(),
            content: content.into(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub folder: PathBuf,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct UserPreference {
    selection: Option<ModelSelection>,
    show_thinking: Option<bool>,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<UserId, HashMap<String, SessionRecord>>,
    active: HashMap<UserId, String>,
    preferences: HashMap<UserId, UserPreference>,
}

impl StoreState {
    fn id_taken(&self, id: &str) -> bool {
        self.sessions.values().any(|s| s.contains_key(id))
    }
}

pub struct SessionStore {
    work_dir: PathBuf,
    state: RwLock<StoreState>,
    defaults: Arc<dyn DefaultProvider>,
}

impl SessionStore {
    pub fn new(work_dir: impl Into<PathBuf>, defaults: Arc<dyn DefaultProvider>) -> Self {
        Self {
            work_dir: work_dir.into(),
            state: RwLock::new(StoreState::default()),
            defaults,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Create a session with its folder and make it the user's active one.
    pub async fn create_session(&self, user_id: UserId) -> Result<SessionRecord, StoreError> {
        let id = {
            let state = self.state.read();
            let mut id = Uuid::new_v4().to_string();
            while state.id_taken(&id) {
                id = Uuid::new_v4().to_string();
            }
            id
        };

        // The folder exists before the record becomes visible.
        let work_dir = self.work_dir.clone();
        let folder_id = id.clone();
        let folder =
            tokio::task::spawn_blocking(move || ensure_session_folder(&work_dir, &folder_id))
                .await??;

        let record = SessionRecord {
            id: id.clone(),
            user_id,
            created_at: Utc::now(),
            folder,
            messages: Vec::new(),
        };

        {
            let mut state = self.state.write();
            state
                .sessions
                .entry(user_id)
                .or_default()
                .insert(id.clone(), record.clone());
            state.active.insert(user_id, id.clone());
        }
        log::info!("Created session {} for user {}", id, user_id);
        Ok(record)
    }

    pub fn get_active_session(&self, user_id: UserId) -> Option<SessionRecord> {
        let state = self.state.read();
        let id = state.active.get(&user_id)?;
        state.sessions.get(&user_id)?.get(id).cloned()
    }

    /// Every session of the user, oldest first.
    pub fn list_sessions(&self, user_id: UserId) -> Vec<SessionRecord> {
        let state = self.state.read();
        let mut sessions: Vec<_> = state
            .sessions
            .get(&user_id)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Point the user at one of their own sessions. Unknown ids change nothing.
    pub fn switch_session(&self, user_id: UserId, session_id: &str) -> bool {
        let mut state = self.state.write();
        let exists = state
            .sessions
            .get(&user_id)
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false);
        if exists {
            state.active.insert(user_id, session_id.to_string());
        }
        exists
    }

    /// Append to a session's message log. False if the session is unknown.
    pub fn append_message(&self, user_id: UserId, session_id: &str, message: Message) -> bool {
        let mut state = self.state.write();
        match state
            .sessions
            .get_mut(&user_id)
            .and_then(|s| s.get_mut(session_id))
        {
            Some(record) => {
                record.messages.push(message);
                true
            }
            None => false,
        }
    }

    pub fn set_preference(&self, user_id: UserId, selection: ModelSelection) {
        let mut state = self.state.write();
        state.preferences.entry(user_id).or_default().selection = Some(selection);
    }

    /// Explicitly chosen provider/model, without any fallback.
    pub fn stored_preference(&self, user_id: UserId) -> Option<ModelSelection> {
        let state = self.state.read();
        state.preferences.get(&user_id)?.selection.clone()
    }

    /// The user's choice, or the live default when nothing was chosen. The
    /// default is not remembered.
    pub async fn get_preference(&self, user_id: UserId) -> ModelSelection {
        match self.stored_preference(user_id) {
            Some(selection) => selection,
            None => self.defaults.default_selection().await,
        }
    }

    pub fn set_thinking_preference(&self, user_id: UserId, show: bool) {
        let mut state = self.state.write();
        state.preferences.entry(user_id).or_default().show_thinking = Some(show);
    }

    pub fn get_thinking_preference(&self, user_id: UserId) -> bool {
        let state = self.state.read();
        state
            .preferences
            .get(&user_id)
            .and_then(|p| p.show_thinking)
            .unwrap_or(true)
    }
}
