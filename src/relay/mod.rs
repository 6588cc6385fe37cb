//! Chat-facing orchestration.
//!
//! [`Relay`] turns inbound chat messages and menu choices into session,
//! provider, coding-task, file and publish operations, and reports back
//! through a [`ChatTransport`]. Everything below the relay returns values
//! rather than failing the flow; the relay decides what the user reads.

pub mod code_extract;
pub mod delivery;
pub mod guard;
pub mod thinking;
pub mod transport;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::agent::types::{excerpt, ERROR_EXCERPT_CHARS};
use crate::agent::{AgentService, CodingTask, ModelSelection, SelectionError, TaskOutcome};
use crate::archive::format_size;
use crate::config::Settings;
use crate::sessions::files::{list_files, read_file, save_file, SessionFile, SessionFileError};
use crate::sessions::{Message, Publisher, SessionRecord, SessionStore, UserId};

pub use code_extract::extract_code;
pub use delivery::{deliver_changes, deliver_files, DeliveryOptions, DeliveryReport};
pub use guard::{BuildGuard, BuildPermit};
pub use thinking::ThinkingForwarder;
pub use transport::{
    Attachment, ChatId, ChatTransport, Choice, FilePayload, InboundMessage, MessageId,
    OutboundFile, TransportError,
};

/// Characters of a file shown by `/view`.
pub const VIEW_MAX_CHARS: usize = 4000;
/// Characters of the current content shown before an edit.
pub const EDIT_PREVIEW_CHARS: usize = 500;
/// Characters of a failure shown in the status message.
const FAILURE_DISPLAY_CHARS: usize = 500;
/// Characters of the result used when the final message has to be squeezed
/// into the status message.
const FALLBACK_RESULT_CHARS: usize = 1000;

pub const HELP_TEXT: &str = "Available commands:\n\n\
Sessions\n\
/newsession - Start a new coding session\n\
/sessions - List your sessions\n\
/switch <id> - Switch the active session\n\n\
Coding\n\
/generate [prompt] - Generate code\n\
/debug - Debug code\n\
/refactor - Refactor code\n\
/cancel - Cancel the current operation\n\n\
Files\n\
/files - List session files\n\
/view <file> - Show a file\n\
/edit <file> - Create or replace a file\n\
/download - Download all session files\n\
/publish - Publish session files to the repository\n\n\
Settings\n\
/providers - Choose provider and model\n\
/thinking [on|off] - Toggle thinking display";

/// Problems with what the user asked for. Reported back as-is and never
/// reach the agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("You need an active session. Use /newsession first.")]
    NoActiveSession,
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Session not found.")]
    SessionNotFound,
    #[error("File not found: {0}\n\nUse /files to see available files.")]
    FileNotFound(String),
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    #[error("A task is already running in this session. Wait for it to finish.")]
    SessionBusy,
    #[error("No code found. Send code as text, in a fenced block, as a text file, or reply to a message that contains it.")]
    NoCode,
    #[error("Please send text.")]
    TextRequired,
    #[error("Unknown command: /{0}. Use /help to see all commands.")]
    UnknownCommand(String),
    #[error("Invalid choice.")]
    InvalidChoice,
    #[error("{0}")]
    Selection(#[from] SelectionError),
    #[error("{0}")]
    Failed(String),
}

impl From<SessionFileError> for RelayError {
    fn from(e: SessionFileError) -> Self {
        match e {
            SessionFileError::InvalidName(name) => RelayError::InvalidFileName(name),
            SessionFileError::NotFound(name) => RelayError::FileNotFound(name),
            SessionFileError::Io(e) => RelayError::Failed(format!("File operation failed: {}", e)),
        }
    }
}

/// A parsed `/command [args]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    NewSession,
    Sessions,
    Switch(Option<String>),
    Generate(Option<String>),
    Debug,
    Refactor,
    Providers,
    Thinking(Option<String>),
    Files,
    View(Option<String>),
    Edit(Option<String>),
    Download,
    Publish,
    Cancel,
    Unknown(String),
}

impl Command {
    /// `None` when the text is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.trim().strip_prefix('/')?;
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, Some(args.trim())),
            None => (rest, None),
        };
        // `/cmd@botname`
        let name = name.split('@').next().unwrap_or(name).to_ascii_lowercase();
        let args = args.filter(|a| !a.is_empty()).map(str::to_string);

        Some(match name.as_str() {
            "start" => Command::Start,
            "help" => Command::Help,
            "newsession" | "new_session" => Command::NewSession,
            "sessions" | "listsessions" | "list_sessions" => Command::Sessions,
            "switch" | "switchsession" | "switch_session" => Command::Switch(args),
            "generate" => Command::Generate(args),
            "debug" => Command::Debug,
            "refactor" => Command::Refactor,
            "providers" | "provider" | "model" => Command::Providers,
            "thinking" => Command::Thinking(args),
            "files" => Command::Files,
            "view" => Command::View(args),
            "edit" => Command::Edit(args),
            "download" => Command::Download,
            "publish" => Command::Publish,
            "cancel" => Command::Cancel,
            _ => Command::Unknown(name),
        })
    }
}

/// Input a user still owes for a multi-step command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    GeneratePrompt,
    DebugCode,
    DebugError { code: String },
    RefactorCode,
    RefactorFocus { code: String },
    EditContent {
        session_id: String,
        file_name: String,
        /// Character count of the file being replaced; `None` when creating.
        original_chars: Option<usize>,
    },
}

/// What the user is told once a coding task finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReply {
    Completed { title: &'static str, body: String },
    Failed { title: &'static str, message: String },
}

struct TaskWording {
    status: &'static str,
    done: &'static str,
    failed: &'static str,
}

fn wording(task: &CodingTask) -> TaskWording {
    match task {
        CodingTask::Generate { .. } => TaskWording {
            status: "Generating code",
            done: "Code Generated",
            failed: "Error Generating Code",
        },
        CodingTask::Debug { .. } => TaskWording {
            status: "Debugging code",
            done: "Code Debugged",
            failed: "Error Debugging Code",
        },
        CodingTask::Refactor { .. } => TaskWording {
            status: "Refactoring code",
            done: "Code Refactored",
            failed: "Error Refactoring Code",
        },
    }
}

impl TaskReply {
    pub fn from_outcome(task: &CodingTask, outcome: &TaskOutcome) -> Self {
        let words = wording(task);
        if outcome.invocation.error {
            TaskReply::Failed {
                title: words.failed,
                message: outcome.invocation.response.clone(),
            }
        } else {
            TaskReply::Completed {
                title: words.done,
                body: outcome.invocation.response.clone(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskReply::Completed { .. })
    }

    /// Full message text.
    pub fn render(&self) -> String {
        match self {
            TaskReply::Completed { title, body } => format!("{}\n\n```\n{}\n```", title, body),
            TaskReply::Failed { title, message } => format!(
                "{}\n\n```\n{}\n```",
                title,
                excerpt(message, FAILURE_DISPLAY_CHARS)
            ),
        }
    }

    /// Shortened text for fallbacks.
    pub fn render_short(&self) -> String {
        match self {
            TaskReply::Completed { title, body } => format!(
                "{}\n\n```\n{}\n```",
                title,
                excerpt(body, FALLBACK_RESULT_CHARS)
            ),
            TaskReply::Failed { title, message } => {
                format!("{}: {}", title, excerpt(message, ERROR_EXCERPT_CHARS))
            }
        }
    }
}

pub struct Relay {
    settings: Settings,
    store: Arc<SessionStore>,
    agent: Arc<dyn AgentService>,
    transport: Arc<dyn ChatTransport>,
    publisher: Publisher,
    guard: BuildGuard,
    pending: Mutex<HashMap<UserId, PendingAction>>,
}

impl Relay {
    pub fn new(
        settings: Settings,
        store: Arc<SessionStore>,
        agent: Arc<dyn AgentService>,
        transport: Arc<dyn ChatTransport>,
        publisher: Publisher,
    ) -> Self {
        Self {
            settings,
            store,
            agent,
            transport,
            publisher,
            guard: BuildGuard::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn pending_action(&self, user_id: UserId) -> Option<PendingAction> {
        self.pending.lock().get(&user_id).cloned()
    }

    fn set_pending(&self, user_id: UserId, action: PendingAction) {
        self.pending.lock().insert(user_id, action);
    }

    fn take_pending(&self, user_id: UserId) -> Option<PendingAction> {
        self.pending.lock().remove(&user_id)
    }

    fn delivery_options(&self) -> DeliveryOptions {
        DeliveryOptions {
            limits: self.settings.archive_limits(),
            threshold: self.settings.max_files_before_archive,
        }
    }

    async fn reply(&self, chat_id: ChatId, text: impl Into<String>) {
        if let Err(e) = self.transport.send_text(chat_id, text.into()).await {
            log::warn!("Failed to send message to chat {}: {}", chat_id, e);
        }
    }

    fn active_session(&self, user_id: UserId) -> Result<SessionRecord, RelayError> {
        self.store
            .get_active_session(user_id)
            .ok_or(RelayError::NoActiveSession)
    }

    // ── entry points ──

    /// Handle one inbound message: a command, or input for a pending step.
    pub async fn handle_message(&self, message: InboundMessage) {
        let text = message.text.as_deref().unwrap_or("").trim();
        log::debug!(
            "Inbound message: user={}, chat={}, message={}",
            message.user_id,
            message.chat_id,
            message.message_id
        );

        let result = match Command::parse(text) {
            Some(command) => self.handle_command(command, &message).await,
            None => match self.take_pending(message.user_id) {
                Some(action) => self.continue_pending(action, &message).await,
                None => {
                    self.reply(message.chat_id, "Send a command to get started. /help lists them.")
                        .await;
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            log::info!("Request from user {} rejected: {}", message.user_id, e);
            self.reply(message.chat_id, e.to_string()).await;
        }
    }

    /// Handle a menu choice: `provider:<id>`, `model:<provider>:<model>` or
    /// `providers:back`.
    pub async fn handle_choice(&self, user_id: UserId, chat_id: ChatId, data: &str) {
        let result = self.apply_choice(user_id, chat_id, data).await;
        if let Err(e) = result {
            log::info!("Choice {:?} from user {} rejected: {}", data, user_id, e);
            self.reply(chat_id, e.to_string()).await;
        }
    }

    async fn apply_choice(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        data: &str,
    ) -> Result<(), RelayError> {
        if data == "providers:back" {
            return self.show_providers(user_id, chat_id, None).await;
        }
        if let Some(provider_id) = data.strip_prefix("provider:") {
            let models = self.select_provider(user_id, provider_id).await?;
            return self.show_models(user_id, chat_id, provider_id, &models).await;
        }
        if let Some(rest) = data.strip_prefix("model:") {
            let (provider_id, model_id) = rest.split_once(':').ok_or(RelayError::InvalidChoice)?;
            let selection = self.select_model(user_id, provider_id, model_id).await?;
            self.reply(chat_id, format!("Selected model: {}", selection.label()))
                .await;
            return Ok(());
        }
        Err(RelayError::InvalidChoice)
    }

    async fn handle_command(
        &self,
        command: Command,
        message: &InboundMessage,
    ) -> Result<(), RelayError> {
        let user_id = message.user_id;
        let chat_id = message.chat_id;
        // Any command abandons a half-finished one.
        let abandoned = self.take_pending(user_id);

        match command {
            Command::Start => {
                self.reply(
                    chat_id,
                    format!("Welcome! I relay your coding requests to the agent.\n\n{}", HELP_TEXT),
                )
                .await;
                Ok(())
            }
            Command::Help => {
                self.reply(chat_id, HELP_TEXT).await;
                Ok(())
            }
            Command::NewSession => self.new_session(user_id, chat_id).await,
            Command::Sessions => self.list_sessions(user_id, chat_id).await,
            Command::Switch(id) => {
                let id = id.ok_or(RelayError::Usage("/switch <session_id>"))?;
                if !self.store.switch_session(user_id, &id) {
                    return Err(RelayError::SessionNotFound);
                }
                self.reply(chat_id, format!("Switched to session: {}", id)).await;
                Ok(())
            }
            Command::Generate(prompt) => {
                self.active_session(user_id)?;
                match prompt {
                    Some(prompt) => {
                        self.run_coding_task(user_id, chat_id, CodingTask::Generate { prompt })
                            .await
                    }
                    None => {
                        self.set_pending(user_id, PendingAction::GeneratePrompt);
                        self.reply(chat_id, "Describe the code you want generated.")
                            .await;
                        Ok(())
                    }
                }
            }
            Command::Debug | Command::Refactor => {
                self.active_session(user_id)?;
                let debugging = command == Command::Debug;
                let replied_code = message.reply_to.as_deref().and_then(extract_code);
                let (action, prompt) = match (replied_code, debugging) {
                    (Some(code), true) => (
                        PendingAction::DebugError { code },
                        "Describe the error you are getting.",
                    ),
                    (Some(code), false) => (
                        PendingAction::RefactorFocus { code },
                        "What should the refactoring focus on?",
                    ),
                    (None, true) => (PendingAction::DebugCode, "Send the code to debug."),
                    (None, false) => (PendingAction::RefactorCode, "Send the code to refactor."),
                };
                self.set_pending(user_id, action);
                self.reply(chat_id, prompt).await;
                Ok(())
            }
            Command::Providers => self.show_providers(user_id, chat_id, None).await,
            Command::Thinking(arg) => {
                let show = match arg.as_deref().map(str::to_ascii_lowercase).as_deref() {
                    None => !self.store.get_thinking_preference(user_id),
                    Some("on") => true,
                    Some("off") => false,
                    Some(_) => return Err(RelayError::Usage("/thinking [on|off]")),
                };
                self.store.set_thinking_preference(user_id, show);
                let state = if show { "enabled" } else { "disabled" };
                self.reply(chat_id, format!("Thinking display {}.", state)).await;
                Ok(())
            }
            Command::Files => self.show_files(user_id, chat_id).await,
            Command::View(name) => {
                let name = name.ok_or(RelayError::Usage("/view <filename>"))?;
                self.view_file(user_id, chat_id, &name).await
            }
            Command::Edit(name) => {
                let name = name.ok_or(RelayError::Usage("/edit <filename>"))?;
                self.begin_edit(user_id, chat_id, &name).await
            }
            Command::Download => self.download(user_id, chat_id).await,
            Command::Publish => self.publish(user_id, chat_id).await,
            Command::Cancel => {
                let text = if abandoned.is_some() {
                    "Operation cancelled."
                } else {
                    "No operation to cancel."
                };
                self.reply(chat_id, text).await;
                Ok(())
            }
            Command::Unknown(name) => Err(RelayError::UnknownCommand(name)),
        }
    }

    async fn continue_pending(
        &self,
        action: PendingAction,
        message: &InboundMessage,
    ) -> Result<(), RelayError> {
        let user_id = message.user_id;
        let chat_id = message.chat_id;
        let text = message
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        match action {
            PendingAction::GeneratePrompt => {
                let Some(prompt) = text else {
                    self.set_pending(user_id, PendingAction::GeneratePrompt);
                    return Err(RelayError::TextRequired);
                };
                self.run_coding_task(user_id, chat_id, CodingTask::Generate { prompt })
                    .await
            }
            PendingAction::DebugCode | PendingAction::RefactorCode => {
                let Some(code) = extract_code(message) else {
                    self.set_pending(user_id, action);
                    return Err(RelayError::NoCode);
                };
                let (next, prompt) = if action == PendingAction::DebugCode {
                    (
                        PendingAction::DebugError { code },
                        "Describe the error you are getting.",
                    )
                } else {
                    (
                        PendingAction::RefactorFocus { code },
                        "What should the refactoring focus on?",
                    )
                };
                self.set_pending(user_id, next);
                self.reply(chat_id, prompt).await;
                Ok(())
            }
            PendingAction::DebugError { code } => {
                let Some(error) = text else {
                    self.set_pending(user_id, PendingAction::DebugError { code });
                    return Err(RelayError::TextRequired);
                };
                self.run_coding_task(user_id, chat_id, CodingTask::Debug { code, error })
                    .await
            }
            PendingAction::RefactorFocus { code } => {
                let Some(focus) = text else {
                    self.set_pending(user_id, PendingAction::RefactorFocus { code });
                    return Err(RelayError::TextRequired);
                };
                self.run_coding_task(user_id, chat_id, CodingTask::Refactor { code, focus })
                    .await
            }
            PendingAction::EditContent {
                session_id,
                file_name,
                original_chars,
            } => {
                // Content is taken verbatim, surrounding whitespace included.
                let Some(content) = message.text.clone().filter(|t| !t.trim().is_empty()) else {
                    self.set_pending(
                        user_id,
                        PendingAction::EditContent {
                            session_id,
                            file_name,
                            original_chars,
                        },
                    );
                    return Err(RelayError::TextRequired);
                };
                self.finish_edit(user_id, chat_id, &session_id, &file_name, original_chars, content)
                    .await
            }
        }
    }

    // ── sessions ──

    async fn new_session(&self, user_id: UserId, chat_id: ChatId) -> Result<(), RelayError> {
        let session = self
            .store
            .create_session(user_id)
            .await
            .map_err(|e| RelayError::Failed(format!("Failed to create session: {}", e)))?;
        log::info!("Created session {} for user {}", session.id, user_id);
        self.reply(
            chat_id,
            format!(
                "Created new session!\nSession ID: {}\nFolder: {}\n\n\
                 All files created by the agent will be saved in this folder.\n\
                 Use /publish to share them.",
                session.id,
                session.folder.display()
            ),
        )
        .await;
        Ok(())
    }

    async fn list_sessions(&self, user_id: UserId, chat_id: ChatId) -> Result<(), RelayError> {
        let sessions = self.store.list_sessions(user_id);
        if sessions.is_empty() {
            self.reply(chat_id, "No sessions found. Start one with /newsession")
                .await;
            return Ok(());
        }
        let active = self.store.get_active_session(user_id).map(|s| s.id);
        let mut text = String::from("Your sessions:\n");
        for session in sessions {
            let marker = if active.as_deref() == Some(session.id.as_str()) {
                " (active)"
            } else {
                ""
            };
            text.push_str(&format!(
                "- {}{}\n  Created: {}\n",
                session.id,
                marker,
                session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        self.reply(chat_id, text.trim_end()).await;
        Ok(())
    }

    // ── providers ──

    /// Store `provider_id` with its first model. Returns the provider's
    /// models for a follow-up choice.
    pub async fn select_provider(
        &self,
        user_id: UserId,
        provider_id: &str,
    ) -> Result<Vec<String>, SelectionError> {
        let catalog = self.agent.providers().await;
        let selection = catalog.select_provider(provider_id)?;
        let models = catalog
            .usable_provider(provider_id)
            .map(|p| p.model_ids())
            .unwrap_or_default();
        log::info!("User {} selected provider {}", user_id, selection.label());
        self.store.set_preference(user_id, selection);
        Ok(models)
    }

    pub async fn select_model(
        &self,
        user_id: UserId,
        provider_id: &str,
        model_id: &str,
    ) -> Result<ModelSelection, SelectionError> {
        let catalog = self.agent.providers().await;
        let selection = catalog.select_model(provider_id, model_id)?;
        log::info!("User {} selected model {}", user_id, selection.label());
        self.store.set_preference(user_id, selection.clone());
        Ok(selection)
    }

    async fn show_providers(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        notice: Option<String>,
    ) -> Result<(), RelayError> {
        let catalog = self.agent.providers().await;
        let connected = catalog.connected_providers();
        let mut text = notice.map(|n| format!("{}\n\n", n)).unwrap_or_default();

        if connected.is_empty() {
            text.push_str(
                "No connected providers found.\n\n\
                 Connect a provider in the agent first (configure its API key), \
                 then try again.",
            );
            self.reply(chat_id, text).await;
            return Ok(());
        }

        let current = self.store.get_preference(user_id).await;
        text.push_str(&format!(
            "Current selection: {}\n\nSelect a provider:",
            current.label()
        ));
        let choices = connected
            .iter()
            .map(|p| {
                let marker = if p.id == current.provider_id { "* " } else { "" };
                Choice::new(format!("{}{}", marker, p.display_name()), format!("provider:{}", p.id))
            })
            .collect();
        self.transport
            .send_choices(chat_id, text, choices)
            .await
            .map_err(|e| RelayError::Failed(format!("Failed to show providers: {}", e)))?;
        Ok(())
    }

    async fn show_models(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        provider_id: &str,
        models: &[String],
    ) -> Result<(), RelayError> {
        let current = self.store.get_preference(user_id).await;
        let text = format!(
            "Selected {}. Select a model (current: {}):",
            provider_id, current.model_id
        );
        let mut choices: Vec<Choice> = models
            .iter()
            .map(|model| {
                let marker = if *model == current.model_id { "* " } else { "" };
                Choice::new(
                    format!("{}{}", marker, model),
                    format!("model:{}:{}", provider_id, model),
                )
            })
            .collect();
        choices.push(Choice::new("Back to providers", "providers:back"));
        self.transport
            .send_choices(chat_id, text, choices)
            .await
            .map_err(|e| RelayError::Failed(format!("Failed to show models: {}", e)))?;
        Ok(())
    }

    /// The user's selection if it can run; otherwise fall back to the
    /// default, persist it and ask the user to confirm via the provider menu.
    async fn checked_selection(&self, user_id: UserId, chat_id: ChatId) -> Option<ModelSelection> {
        let selection = self.store.get_preference(user_id).await;
        if selection.provider_id.is_empty() {
            return Some(selection);
        }
        let catalog = self.agent.providers().await;
        if catalog.is_usable(&selection) {
            return Some(selection);
        }

        let fallback = catalog.default_selection();
        let problem = if catalog.is_connected(&selection.provider_id) {
            format!(
                "Model {} is no longer offered by {}",
                selection.model_id, selection.provider_id
            )
        } else {
            format!("Provider {} is no longer connected", selection.provider_id)
        };
        log::warn!(
            "User {} selection {} is unusable ({}), falling back to {}",
            user_id,
            selection.label(),
            problem,
            fallback.label()
        );
        if fallback.is_complete() {
            self.store.set_preference(user_id, fallback.clone());
        }
        let notice = format!(
            "{}. Switched to {}. Pick a provider and send the request again.",
            problem,
            fallback.label()
        );
        if let Err(e) = self.show_providers(user_id, chat_id, Some(notice)).await {
            self.reply(chat_id, e.to_string()).await;
        }
        None
    }

    // ── coding tasks ──

    async fn run_coding_task(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        task: CodingTask,
    ) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        let _permit = self
            .guard
            .try_acquire(&session.id)
            .ok_or(RelayError::SessionBusy)?;

        let Some(selection) = self.checked_selection(user_id, chat_id).await else {
            return Ok(());
        };

        let words = wording(&task);
        let status_id = match self
            .transport
            .send_text(
                chat_id,
                format!("{} using {}... Please wait.", words.status, selection.label()),
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Failed to send status message: {}", e);
                None
            }
        };

        log::info!(
            "Running task for user {} in session {}: {}",
            user_id,
            session.id,
            task.session_label()
        );
        self.store
            .append_message(user_id, &session.id, Message::new("user", task.prompt()));

        let sink = ThinkingForwarder::new(
            self.transport.clone(),
            self.store.clone(),
            user_id,
            chat_id,
        );
        let outcome = self
            .agent
            .run_task(task.clone(), &session.id, &selection, &sink)
            .await;

        let reply = TaskReply::from_outcome(&task, &outcome);
        self.send_task_reply(chat_id, status_id, &reply).await;

        if reply.is_success() && !outcome.files.is_empty() {
            let report = deliver_changes(
                self.transport.as_ref(),
                chat_id,
                &outcome.session_folder,
                &outcome.files,
                self.delivery_options(),
            )
            .await;
            log::info!(
                "Delivered {} of {} changed files",
                report.delivered,
                outcome.files.len()
            );
        }

        self.store.append_message(
            user_id,
            &session.id,
            Message::new("assistant", outcome.invocation.response),
        );
        Ok(())
    }

    async fn send_task_reply(&self, chat_id: ChatId, status_id: Option<MessageId>, reply: &TaskReply) {
        match reply {
            TaskReply::Failed { .. } => {
                if let Some(id) = status_id {
                    match self.transport.edit_text(chat_id, id, reply.render()).await {
                        Ok(()) => return,
                        Err(e) => log::error!("Failed to update status message: {}", e),
                    }
                }
                self.reply(chat_id, reply.render_short()).await;
            }
            TaskReply::Completed { .. } => {
                if let Some(id) = status_id {
                    if let Err(e) = self.transport.delete_message(chat_id, id).await {
                        log::debug!("Could not delete status message: {}", e);
                    }
                }
                let Err(e) = self.transport.send_text(chat_id, reply.render()).await else {
                    return;
                };
                log::error!("Failed to send final result: {}", e);

                if let Some(id) = status_id {
                    match self
                        .transport
                        .edit_text(chat_id, id, reply.render_short())
                        .await
                    {
                        Ok(()) => return,
                        Err(e) => log::error!("Failed to update status message: {}", e),
                    }
                }
                self.reply(
                    chat_id,
                    "The task finished, but the result could not be displayed. Use /files to see what changed.",
                )
                .await;
            }
        }
    }

    // ── session files ──

    async fn session_files(&self, folder: PathBuf) -> Result<Vec<SessionFile>, RelayError> {
        tokio::task::spawn_blocking(move || list_files(&folder))
            .await
            .map_err(|e| RelayError::Failed(format!("File task failed: {}", e)))?
            .map_err(RelayError::from)
    }

    async fn read_session_file(
        &self,
        folder: PathBuf,
        name: &str,
    ) -> Result<Option<String>, RelayError> {
        let name = name.to_string();
        tokio::task::spawn_blocking(move || read_file(&folder, &name))
            .await
            .map_err(|e| RelayError::Failed(format!("File task failed: {}", e)))?
            .map_err(RelayError::from)
    }

    async fn show_files(&self, user_id: UserId, chat_id: ChatId) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        let files = self.session_files(session.folder.clone()).await?;
        if files.is_empty() {
            self.reply(chat_id, "No files in session folder yet.").await;
            return Ok(());
        }
        let mut text = format!("Files in session {} ({}):\n", short_id(&session.id), files.len());
        for file in &files {
            let modified = file
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            text.push_str(&format!(
                "- {} ({}, {})\n",
                file.name,
                format_size(file.size),
                modified
            ));
        }
        self.reply(chat_id, text.trim_end()).await;
        Ok(())
    }

    async fn view_file(&self, user_id: UserId, chat_id: ChatId, name: &str) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        let content = self
            .read_session_file(session.folder.clone(), name)
            .await?
            .ok_or_else(|| RelayError::FileNotFound(name.to_string()))?;

        let shown = if content.chars().count() > VIEW_MAX_CHARS {
            let head: String = content.chars().take(VIEW_MAX_CHARS).collect();
            format!("{}\n\n... (truncated, file too large)", head)
        } else {
            content
        };
        self.reply(
            chat_id,
            format!(
                "{}\nSession: {}\n\n```\n{}\n```",
                name,
                short_id(&session.id),
                shown
            ),
        )
        .await;
        Ok(())
    }

    async fn begin_edit(&self, user_id: UserId, chat_id: ChatId, name: &str) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        let existing = self.read_session_file(session.folder.clone(), name).await?;

        let text = match &existing {
            None => format!(
                "File {} doesn't exist in the current session.\n\n\
                 Send the content to create it, or /cancel to abort.",
                name
            ),
            Some(content) => {
                let preview = if content.chars().count() > EDIT_PREVIEW_CHARS {
                    excerpt(content, EDIT_PREVIEW_CHARS)
                } else {
                    content.clone()
                };
                format!(
                    "Editing {}\n\nCurrent content (first {} chars):\n```\n{}\n```\n\n\
                     Send the new content for this file, or /cancel to abort.",
                    name, EDIT_PREVIEW_CHARS, preview
                )
            }
        };
        self.set_pending(
            user_id,
            PendingAction::EditContent {
                session_id: session.id,
                file_name: name.to_string(),
                original_chars: existing.map(|c| c.chars().count()),
            },
        );
        self.reply(chat_id, text).await;
        Ok(())
    }

    async fn finish_edit(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        session_id: &str,
        file_name: &str,
        original_chars: Option<usize>,
        content: String,
    ) -> Result<(), RelayError> {
        // The edit targets the session it started in, even after a switch.
        let session = self
            .store
            .list_sessions(user_id)
            .into_iter()
            .find(|s| s.id == session_id)
            .ok_or(RelayError::SessionNotFound)?;

        let new_chars = content.chars().count();
        let folder = session.folder;
        let name = file_name.to_string();
        tokio::task::spawn_blocking(move || save_file(&folder, &name, &content))
            .await
            .map_err(|e| RelayError::Failed(format!("File task failed: {}", e)))?
            .map_err(|e| {
                log::error!("Failed to save {}: {}", file_name, e);
                RelayError::Failed("Failed to save file. Please try again.".to_string())
            })?;

        let text = match original_chars {
            None => format!("Created new file: {}", file_name),
            Some(before) => format!(
                "Updated file: {} ({:+} characters)",
                file_name,
                new_chars as i64 - before as i64
            ),
        };
        self.reply(chat_id, text).await;
        Ok(())
    }

    async fn download(&self, user_id: UserId, chat_id: ChatId) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        let names: Vec<String> = self
            .session_files(session.folder.clone())
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();
        if names.is_empty() {
            self.reply(chat_id, "No files in session folder to download.")
                .await;
            return Ok(());
        }

        self.reply(chat_id, format!("Preparing to download {} files...", names.len()))
            .await;
        let report = deliver_files(
            self.transport.as_ref(),
            chat_id,
            &session.folder,
            &names,
            self.delivery_options(),
        )
        .await;
        log::info!(
            "Download for user {}: {} files delivered, {} failed sends",
            user_id,
            report.delivered,
            report.failed_sends
        );
        Ok(())
    }

    async fn publish(&self, user_id: UserId, chat_id: ChatId) -> Result<(), RelayError> {
        let session = self.active_session(user_id)?;
        self.reply(chat_id, "Publishing session files...").await;

        let outcome = self.publisher.publish(&session.id, &session.folder).await;
        let text = match (&outcome.error, outcome.success) {
            (None, true) => format!(
                "Published {} files to work_place/{}:\n{}",
                outcome.files_copied.len(),
                session.id,
                outcome
                    .files_copied
                    .iter()
                    .map(|f| format!("- {}", f))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
            (Some(failure), _) => failure.message().to_string(),
            (None, false) => "Publish failed.".to_string(),
        };
        self.reply(chat_id, text).await;
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    use super::transport::{ChatId, ChatTransport, Choice, MessageId, OutboundFile, TransportError};
    use crate::agent::sink::ThinkingSink;
    use crate::agent::{
        AgentService, CodingTask, InvocationResult, ModelSelection, ProviderCatalog, ProviderInfo,
        TaskOutcome,
    };
    use crate::sessions::files::session_folder_path;
    use crate::sessions::{DefaultProvider, SessionStore};
    use crate::tracker::FileChanges;

    pub(crate) struct FixedDefault(pub ModelSelection);

    #[async_trait]
    impl DefaultProvider for FixedDefault {
        async fn default_selection(&self) -> ModelSelection {
            self.0.clone()
        }
    }

    pub(crate) fn store(dir: &TempDir) -> Arc<SessionStore> {
        Arc::new(SessionStore::new(
            dir.path(),
            Arc::new(FixedDefault(ModelSelection::new("openai", "gpt-4o"))),
        ))
    }

    pub(crate) fn catalog(connected: &[&str]) -> ProviderCatalog {
        let provider = |id: &str, models: &[&str]| ProviderInfo {
            id: id.to_string(),
            name: id.to_uppercase(),
            models: models
                .iter()
                .map(|m| (m.to_string(), serde_json::json!({})))
                .collect(),
        };
        ProviderCatalog {
            all: vec![
                provider("openai", &["gpt-4o", "gpt-4o-mini"]),
                provider("anthropic", &["claude-sonnet"]),
                provider("empty", &[]),
            ],
            connected: connected.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Agent stand-in: records calls, emits one thinking block and writes the
    /// configured files into the session folder.
    pub(crate) struct FakeAgent {
        pub work_dir: PathBuf,
        pub catalog: ProviderCatalog,
        pub response: InvocationResult,
        pub files: Vec<(String, String)>,
        pub calls: Mutex<Vec<(CodingTask, String, ModelSelection)>>,
    }

    impl FakeAgent {
        pub(crate) fn new(dir: &TempDir, response: &str) -> Self {
            Self {
                work_dir: dir.path().to_path_buf(),
                catalog: catalog(&["openai"]),
                response: InvocationResult {
                    response: response.to_string(),
                    ..Default::default()
                },
                files: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<(CodingTask, String, ModelSelection)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AgentService for FakeAgent {
        async fn providers(&self) -> ProviderCatalog {
            self.catalog.clone()
        }

        async fn default_provider(&self) -> ModelSelection {
            self.catalog.default_selection()
        }

        async fn run_task(
            &self,
            task: CodingTask,
            session_id: &str,
            selection: &ModelSelection,
            sink: &dyn ThinkingSink,
        ) -> TaskOutcome {
            self.calls
                .lock()
                .push((task, session_id.to_string(), selection.clone()));
            let _ = sink.on_thinking("Planning the change").await;

            let folder = session_folder_path(&self.work_dir, session_id);
            for (name, content) in &self.files {
                std::fs::write(folder.join(name), content).unwrap();
            }
            TaskOutcome {
                session_id: session_id.to_string(),
                session_folder: folder,
                invocation: self.response.clone(),
                files: FileChanges::new(self.files.iter().map(|(n, _)| n.clone()), Vec::new()),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Sent {
        Text(String),
        Choices(String, Vec<Choice>),
        Edit(MessageId, String),
        Delete(MessageId),
        File(OutboundFile),
    }

    /// Transport that records everything and can refuse plain text sends.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<Sent>>,
        pub fail_text_containing: Mutex<Option<String>>,
    }

    impl RecordingTransport {
        pub(crate) fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        pub(crate) fn texts(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text(t) | Sent::Choices(t, _) | Sent::Edit(_, t) => Some(t),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn last_text(&self) -> String {
            self.texts().pop().unwrap_or_default()
        }

        fn next_id(&self) -> MessageId {
            self.sent.lock().len() as MessageId + 1
        }
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(&self, _chat_id: ChatId, text: String) -> Result<MessageId, TransportError> {
            if let Some(needle) = self.fail_text_containing.lock().as_deref() {
                if text.contains(needle) {
                    return Err(TransportError::Delivery("refused".into()));
                }
            }
            let id = self.next_id();
            self.sent.lock().push(Sent::Text(text));
            Ok(id)
        }

        async fn send_choices(
            &self,
            _chat_id: ChatId,
            text: String,
            choices: Vec<Choice>,
        ) -> Result<MessageId, TransportError> {
            let id = self.next_id();
            self.sent.lock().push(Sent::Choices(text, choices));
            Ok(id)
        }

        async fn edit_text(
            &self,
            _chat_id: ChatId,
            message_id: MessageId,
            text: String,
        ) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::Edit(message_id, text));
            Ok(())
        }

        async fn delete_message(&self, _chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::Delete(message_id));
            Ok(())
        }

        async fn send_file(&self, _chat_id: ChatId, file: OutboundFile) -> Result<(), TransportError> {
            self.sent.lock().push(Sent::File(file));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::agent::InvocationResult;
    use crate::config::PublishSettings;
    use crate::relay::transport::MockChatTransport;
    use tempfile::TempDir;

    const USER: UserId = 42;
    const CHAT: ChatId = 7;

    struct Harness {
        _dir: TempDir,
        relay: Relay,
        agent: Arc<FakeAgent>,
        transport: Arc<RecordingTransport>,
    }

    fn harness_with(agent: impl FnOnce(&TempDir) -> FakeAgent) -> Harness {
        let dir = TempDir::new().unwrap();
        let agent = Arc::new(agent(&dir));
        let transport = Arc::new(RecordingTransport::default());
        let settings = Settings {
            work_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let publisher = Publisher::new(PublishSettings {
            repo_path: dir.path().join("published"),
            ..PublishSettings::default()
        });
        let relay = Relay::new(
            settings,
            store(&dir),
            agent.clone(),
            transport.clone(),
            publisher,
        );
        Harness {
            _dir: dir,
            relay,
            agent,
            transport,
        }
    }

    fn harness(response: &str) -> Harness {
        harness_with(|dir| FakeAgent::new(dir, response))
    }

    async fn say(h: &Harness, text: &str) {
        h.relay.handle_message(InboundMessage::text(USER, CHAT, text)).await;
    }

    // ── command parsing ──

    #[test]
    fn parses_commands_with_arguments_and_aliases() {
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse("/help"), Some(Command::Help));
        assert_eq!(Command::parse("/new_session"), Some(Command::NewSession));
        assert_eq!(
            Command::parse("/generate  a todo app "),
            Some(Command::Generate(Some("a todo app".into())))
        );
        assert_eq!(Command::parse("/view@relaybot main.py"), Some(Command::View(Some("main.py".into()))));
        assert_eq!(Command::parse("/switch"), Some(Command::Switch(None)));
        assert_eq!(Command::parse("/Model"), Some(Command::Providers));
        assert_eq!(Command::parse("/bogus"), Some(Command::Unknown("bogus".into())));
    }

    #[test]
    fn failed_reply_is_shortened_but_success_is_not() {
        let long = "x".repeat(3000);
        let ok = TaskReply::Completed {
            title: "Code Generated",
            body: long.clone(),
        };
        assert!(ok.render().contains(&long));
        let failed = TaskReply::Failed {
            title: "Error Generating Code",
            message: long,
        };
        assert!(failed.render().len() < 600);
    }

    // ── sessions ──

    #[tokio::test]
    async fn new_session_becomes_active_and_is_listed() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        let session = h.relay.store().get_active_session(USER).unwrap();
        assert!(session.folder.is_dir());
        assert!(h.transport.last_text().contains(&session.id));

        say(&h, "/sessions").await;
        assert!(h.transport.last_text().contains(&format!("{} (active)", session.id)));
    }

    #[tokio::test]
    async fn switching_to_unknown_session_is_rejected() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        let active = h.relay.store().get_active_session(USER).unwrap().id;

        say(&h, "/switch nope").await;
        assert_eq!(h.transport.last_text(), "Session not found.");
        assert_eq!(h.relay.store().get_active_session(USER).unwrap().id, active);

        say(&h, "/switch").await;
        assert_eq!(h.transport.last_text(), "Usage: /switch <session_id>");
    }

    // ── coding tasks ──

    #[tokio::test]
    async fn generate_without_session_never_reaches_agent() {
        let h = harness("ok");
        say(&h, "/generate hello").await;
        assert_eq!(h.transport.last_text(), RelayError::NoActiveSession.to_string());
        assert!(h.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn generate_runs_task_and_sends_result_and_files() {
        let h = harness_with(|dir| {
            let mut agent = FakeAgent::new(dir, "print('hi')");
            agent.files = vec![("hello.py".into(), "print('hi')".into())];
            agent
        });
        say(&h, "/newsession").await;
        let session = h.relay.store().get_active_session(USER).unwrap();

        say(&h, "/generate say hi").await;

        let calls = h.agent.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, CodingTask::Generate { prompt: "say hi".into() });
        assert_eq!(calls[0].1, session.id);
        // The store default applies when the user never chose.
        assert_eq!(calls[0].2, ModelSelection::new("openai", "gpt-4o"));

        let sent = h.transport.sent();
        let status = sent
            .iter()
            .position(|s| matches!(s, Sent::Text(t) if t.starts_with("Generating code using openai/gpt-4o")))
            .unwrap();
        let status_id = status as MessageId + 1;
        assert!(sent.contains(&Sent::Delete(status_id)));
        assert!(sent.contains(&Sent::Text("Thinking: Planning the change".into())));
        assert!(sent.iter().any(
            |s| matches!(s, Sent::Text(t) if t.starts_with("Code Generated") && t.contains("print('hi')"))
        ));
        assert!(sent.iter().any(|s| matches!(s, Sent::File(f) if f.file_name == "hello.py")));

        let messages = h.relay.store().get_active_session(USER).unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "print('hi')");
    }

    #[tokio::test]
    async fn failed_task_edits_status_and_sends_no_files() {
        let h = harness_with(|dir| {
            let mut agent = FakeAgent::new(dir, "");
            agent.response = InvocationResult::failure("The agent timed out after 300 seconds.");
            agent.files = vec![("partial.py".into(), "x".into())];
            agent
        });
        say(&h, "/newsession").await;
        say(&h, "/generate slow thing").await;

        let sent = h.transport.sent();
        assert!(sent.iter().any(
            |s| matches!(s, Sent::Edit(_, t) if t.starts_with("Error Generating Code") && t.contains("timed out"))
        ));
        assert!(!sent.iter().any(|s| matches!(s, Sent::File(_))));
    }

    #[tokio::test]
    async fn final_result_falls_back_to_editing_status() {
        let h = harness("the answer");
        *h.transport.fail_text_containing.lock() = Some("Code Generated".into());
        say(&h, "/newsession").await;
        say(&h, "/generate q").await;

        assert!(h
            .transport
            .sent()
            .iter()
            .any(|s| matches!(s, Sent::Edit(_, t) if t.starts_with("Code Generated") && t.contains("the answer"))));
    }

    #[tokio::test]
    async fn busy_session_rejects_second_task() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        let session = h.relay.store().get_active_session(USER).unwrap();
        let _permit = h.relay.guard.try_acquire(&session.id).unwrap();

        say(&h, "/generate again").await;
        assert_eq!(h.transport.last_text(), RelayError::SessionBusy.to_string());
        assert!(h.agent.calls().is_empty());
    }

    #[tokio::test]
    async fn disconnected_provider_falls_back_and_prompts() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        h.relay
            .store()
            .set_preference(USER, ModelSelection::new("anthropic", "claude-sonnet"));

        say(&h, "/generate hi").await;

        assert!(h.agent.calls().is_empty());
        assert_eq!(
            h.relay.store().stored_preference(USER),
            Some(ModelSelection::new("openai", "gpt-4o"))
        );
        match h.transport.sent().last() {
            Some(Sent::Choices(text, choices)) => {
                assert!(text.contains("anthropic is no longer connected"));
                assert_eq!(choices[0].data, "provider:openai");
            }
            other => panic!("expected provider menu, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_model_falls_back_and_prompts() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        h.relay
            .store()
            .set_preference(USER, ModelSelection::new("openai", "gpt-3.5-retired"));

        say(&h, "/generate hi").await;

        assert!(h.agent.calls().is_empty());
        assert_eq!(
            h.relay.store().stored_preference(USER),
            Some(ModelSelection::new("openai", "gpt-4o"))
        );
        match h.transport.sent().last() {
            Some(Sent::Choices(text, _)) => {
                assert!(text.contains("Model gpt-3.5-retired is no longer offered by openai"));
            }
            other => panic!("expected provider menu, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn debug_collects_code_then_error() {
        let h = harness("fixed");
        say(&h, "/newsession").await;
        say(&h, "/debug").await;
        assert_eq!(h.relay.pending_action(USER), Some(PendingAction::DebugCode));

        say(&h, "```python\nprint(x)\n```").await;
        assert_eq!(
            h.relay.pending_action(USER),
            Some(PendingAction::DebugError { code: "print(x)".into() })
        );

        say(&h, "NameError: x").await;
        assert_eq!(h.relay.pending_action(USER), None);
        assert_eq!(
            h.agent.calls()[0].0,
            CodingTask::Debug {
                code: "print(x)".into(),
                error: "NameError: x".into()
            }
        );
    }

    #[tokio::test]
    async fn refactor_takes_code_from_replied_message() {
        let h = harness("better");
        say(&h, "/newsession").await;
        let mut command = InboundMessage::text(USER, CHAT, "/refactor");
        command.reply_to = Some(Box::new(InboundMessage::text(USER, CHAT, "def f(): pass")));
        h.relay.handle_message(command).await;
        assert_eq!(
            h.relay.pending_action(USER),
            Some(PendingAction::RefactorFocus { code: "def f(): pass".into() })
        );

        say(&h, "naming").await;
        assert_eq!(
            h.agent.calls()[0].0,
            CodingTask::Refactor {
                code: "def f(): pass".into(),
                focus: "naming".into()
            }
        );
    }

    #[tokio::test]
    async fn cancel_clears_pending_input() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        say(&h, "/generate").await;
        assert_eq!(h.relay.pending_action(USER), Some(PendingAction::GeneratePrompt));

        say(&h, "/cancel").await;
        assert_eq!(h.transport.last_text(), "Operation cancelled.");
        say(&h, "build a thing").await;
        assert!(h.agent.calls().is_empty());

        say(&h, "/cancel").await;
        assert_eq!(h.transport.last_text(), "No operation to cancel.");
    }

    // ── providers ──

    #[tokio::test]
    async fn provider_then_model_choice_updates_preference() {
        let h = harness_with(|dir| {
            let mut agent = FakeAgent::new(dir, "ok");
            agent.catalog = catalog(&["openai", "anthropic"]);
            agent
        });

        h.relay.handle_choice(USER, CHAT, "provider:anthropic").await;
        assert_eq!(
            h.relay.store().stored_preference(USER),
            Some(ModelSelection::new("anthropic", "claude-sonnet"))
        );
        match h.transport.sent().last() {
            Some(Sent::Choices(_, choices)) => {
                assert_eq!(choices[0].data, "model:anthropic:claude-sonnet");
                assert_eq!(choices.last().unwrap().data, "providers:back");
            }
            other => panic!("expected model menu, got {:?}", other),
        }

        h.relay.handle_choice(USER, CHAT, "model:openai:gpt-4o-mini").await;
        assert_eq!(
            h.relay.store().stored_preference(USER),
            Some(ModelSelection::new("openai", "gpt-4o-mini"))
        );
    }

    #[tokio::test]
    async fn unusable_choices_are_rejected() {
        let h = harness("ok");
        h.relay.handle_choice(USER, CHAT, "provider:anthropic").await;
        assert_eq!(h.transport.last_text(), "Provider anthropic is not connected");

        h.relay.handle_choice(USER, CHAT, "model:openai:nope").await;
        assert_eq!(h.transport.last_text(), "Model nope is not offered by openai");

        h.relay.handle_choice(USER, CHAT, "garbage").await;
        assert_eq!(h.transport.last_text(), "Invalid choice.");
        assert_eq!(h.relay.store().stored_preference(USER), None);
    }

    #[tokio::test]
    async fn thinking_toggle() {
        let h = harness("ok");
        say(&h, "/thinking").await;
        assert!(!h.relay.store().get_thinking_preference(USER));
        say(&h, "/thinking on").await;
        assert!(h.relay.store().get_thinking_preference(USER));
        assert_eq!(h.transport.last_text(), "Thinking display enabled.");
    }

    // ── files ──

    #[tokio::test]
    async fn edit_then_view_round_trip() {
        let h = harness("ok");
        say(&h, "/newsession").await;

        say(&h, "/edit notes.txt").await;
        assert!(h.transport.last_text().contains("doesn't exist"));
        say(&h, "first draft").await;
        assert_eq!(h.transport.last_text(), "Created new file: notes.txt");

        say(&h, "/edit notes.txt").await;
        assert!(h.transport.last_text().contains("first draft"));
        say(&h, "second draft, longer").await;
        assert_eq!(h.transport.last_text(), "Updated file: notes.txt (+9 characters)");

        say(&h, "/view notes.txt").await;
        assert!(h.transport.last_text().contains("```\nsecond draft, longer\n```"));

        say(&h, "/files").await;
        assert!(h.transport.last_text().contains("- notes.txt (20 B"));
    }

    #[tokio::test]
    async fn view_rejects_missing_and_escaping_names() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        say(&h, "/view missing.py").await;
        assert!(h.transport.last_text().starts_with("File not found: missing.py"));
        say(&h, "/view ../secret").await;
        assert_eq!(h.transport.last_text(), "Invalid file name: ../secret");
    }

    #[tokio::test]
    async fn view_truncates_large_files() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        let folder = h.relay.store().get_active_session(USER).unwrap().folder;
        std::fs::write(folder.join("big.txt"), "a".repeat(VIEW_MAX_CHARS + 100)).unwrap();

        say(&h, "/view big.txt").await;
        let text = h.transport.last_text();
        assert!(text.contains("(truncated, file too large)"));
        assert!(!text.contains(&"a".repeat(VIEW_MAX_CHARS + 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn download_sends_every_top_level_file() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        let folder = h.relay.store().get_active_session(USER).unwrap().folder;
        std::fs::write(folder.join("a.py"), "a").unwrap();
        std::fs::write(folder.join("b.py"), "b").unwrap();
        std::fs::write(folder.join("proc.md"), "transcript").unwrap();

        say(&h, "/download").await;
        let files: Vec<String> = h
            .transport
            .sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::File(f) => Some(f.file_name),
                _ => None,
            })
            .collect();
        assert_eq!(files.len(), 2);
        assert!(files.contains(&"a.py".to_string()));
        assert!(files.contains(&"b.py".to_string()));
    }

    #[tokio::test]
    async fn publish_without_files_reports_failure() {
        let h = harness("ok");
        say(&h, "/newsession").await;
        say(&h, "/publish").await;
        assert!(h.transport.last_text().contains("No files to publish"));
    }

    #[tokio::test]
    async fn unknown_command_and_stray_text_get_hints() {
        let h = harness("ok");
        say(&h, "/frobnicate").await;
        assert!(h.transport.last_text().starts_with("Unknown command: /frobnicate"));
        say(&h, "hello?").await;
        assert!(h.transport.last_text().contains("/help"));
    }

    #[tokio::test]
    async fn unreachable_chat_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let mut transport = MockChatTransport::new();
        transport
            .expect_send_text()
            .returning(|_, _| Err(TransportError::Delivery("offline".into())));
        let relay = Relay::new(
            Settings {
                work_dir: dir.path().to_path_buf(),
                ..Settings::default()
            },
            store(&dir),
            Arc::new(FakeAgent::new(&dir, "ok")),
            Arc::new(transport),
            Publisher::new(PublishSettings::default()),
        );
        relay
            .handle_message(InboundMessage::text(USER, CHAT, "/help"))
            .await;
        relay
            .handle_message(InboundMessage::text(USER, CHAT, "/view x"))
            .await;
    }
}
