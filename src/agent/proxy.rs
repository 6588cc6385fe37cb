//! The agent proxy: one interface over the agent's HTTP API and its CLI.
//!
//! Every coding task runs the same pipeline: provision the session folder,
//! take a before-snapshot, open a transient remote session, run the CLI in the
//! folder, then diff the folder and fold in files the agent announced. Errors
//! never escape: they come back as an [`InvocationResult`] with `error` set.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::client::AgentApiClient;
use super::heuristics::{created_file_mentions, select_response};
use super::runner::{CliInvocation, CliRunner};
use super::sink::ThinkingSink;
use super::types::{
    excerpt, AgentError, CodingTask, InvocationResult, ModelSelection, ProviderCatalog,
    TaskOutcome, RAW_EXCERPT_CHARS,
};
use crate::archive::resolve_relative;
use crate::config::Settings;
use crate::sessions::files::{
    append_transcript, ensure_session_folder, move_into_session, TRANSCRIPT_FILE,
};
use crate::sessions::store::DefaultProvider;
use crate::tracker::{relative_string, ExcludePolicy, FileChangeTracker, FileChanges};

pub const NO_RESPONSE_MESSAGE: &str = "No response received from the agent.";
pub const REMOTE_SESSION_FAILED: &str = "Failed to create agent session";

/// What the orchestration layer needs from the agent.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Provider catalog; empty when the agent cannot be reached.
    async fn providers(&self) -> ProviderCatalog;

    /// First connected provider and its first model, or empty strings.
    async fn default_provider(&self) -> ModelSelection;

    async fn run_task(
        &self,
        task: CodingTask,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome;
}

pub struct AgentProxy {
    client: AgentApiClient,
    runner: CliRunner,
    work_dir: PathBuf,
    exclude: ExcludePolicy,
}

impl AgentProxy {
    pub fn new(
        client: AgentApiClient,
        runner: CliRunner,
        work_dir: impl Into<PathBuf>,
        exclude: ExcludePolicy,
    ) -> Self {
        Self {
            client,
            runner,
            work_dir: work_dir.into(),
            // The transcript is written by us, never reported as agent output.
            exclude: exclude.with_name(TRANSCRIPT_FILE),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, AgentError> {
        let client = AgentApiClient::new(&settings.agent_api_url, settings.http_timeout())?;
        let runner = CliRunner::new(&settings.agent_command, settings.invocation_timeout());
        Ok(Self::new(
            client,
            runner,
            &settings.work_dir,
            ExcludePolicy::new(&settings.excluded_file_patterns),
        ))
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub async fn create_remote_session(&self, title: &str) -> Result<String, AgentError> {
        self.client.create_session(title).await
    }

    pub async fn get_providers(&self) -> ProviderCatalog {
        match self.client.providers().await {
            Ok(catalog) => catalog,
            Err(e) => {
                log::error!("Error getting providers: {}", e);
                ProviderCatalog::default()
            }
        }
    }

    pub async fn get_default_provider(&self) -> ModelSelection {
        self.get_providers().await.default_selection()
    }

    /// Fill a missing provider or model from the default.
    async fn resolve_selection(&self, selection: &ModelSelection) -> ModelSelection {
        if selection.is_complete() {
            return selection.clone();
        }
        let default = self.get_default_provider().await;
        let pick = |chosen: &str, fallback: String| {
            if chosen.is_empty() {
                fallback
            } else {
                chosen.to_string()
            }
        };
        ModelSelection::new(
            pick(&selection.provider_id, default.provider_id),
            pick(&selection.model_id, default.model_id),
        )
    }

    /// Run the CLI once inside `session_folder` and normalize the outcome.
    pub async fn send_message(
        &self,
        prompt: &str,
        selection: &ModelSelection,
        remote_session_id: Option<&str>,
        session_folder: &Path,
        sink: &dyn ThinkingSink,
    ) -> InvocationResult {
        let selection = self.resolve_selection(selection).await;
        let invocation = CliInvocation {
            prompt,
            selection: &selection,
            remote_session_id,
            working_dir: session_folder,
        };

        let output = match self.runner.run(&invocation, sink).await {
            Ok(output) => output,
            Err(e) => {
                log::error!("Agent invocation failed: {}", e);
                let mut result = InvocationResult::failure(e.user_message());
                if let AgentError::Exit { stderr, .. } = &e {
                    result.raw_stderr = excerpt(stderr, RAW_EXCERPT_CHARS);
                }
                return result;
            }
        };

        let full_text = output.text_parts.join("\n");
        let mut response = if full_text.is_empty() {
            String::new()
        } else {
            select_response(&full_text)
        };

        let mentions = created_file_mentions(&output.stderr);
        if response.trim().is_empty() {
            if let Some(first) = mentions.first() {
                match read_mentioned_file(session_folder, first).await {
                    Some(content) => response = content,
                    None => log::warn!("Could not read announced file {}", first),
                }
            }
        }
        let moved_files = relocate_mentions(session_folder, mentions).await;

        let folder = session_folder.to_path_buf();
        let request = prompt.to_string();
        let logged_response = response.clone();
        let thinking = output.thinking.clone();
        let logged = tokio::task::spawn_blocking(move || {
            append_transcript(&folder, &request, &logged_response, &thinking)
        })
        .await;
        match logged {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Failed to write transcript: {}", e),
            Err(e) => log::error!("Transcript task failed: {}", e),
        }

        if response.trim().is_empty() {
            response = NO_RESPONSE_MESSAGE.to_string();
        }

        InvocationResult {
            response,
            thinking: output.thinking,
            events: output.events,
            error: false,
            moved_files,
            raw_stdout: excerpt(&output.stdout, RAW_EXCERPT_CHARS),
            raw_stderr: excerpt(&output.stderr, RAW_EXCERPT_CHARS),
        }
    }

    pub async fn generate_code(
        &self,
        prompt: &str,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome {
        let task = CodingTask::Generate {
            prompt: prompt.to_string(),
        };
        self.execute(task, session_id, selection, sink).await
    }

    pub async fn debug_code(
        &self,
        code: &str,
        error: &str,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome {
        let task = CodingTask::Debug {
            code: code.to_string(),
            error: error.to_string(),
        };
        self.execute(task, session_id, selection, sink).await
    }

    pub async fn refactor_code(
        &self,
        code: &str,
        focus: &str,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome {
        let task = CodingTask::Refactor {
            code: code.to_string(),
            focus: focus.to_string(),
        };
        self.execute(task, session_id, selection, sink).await
    }

    async fn execute(
        &self,
        task: CodingTask,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome {
        let work_dir = self.work_dir.clone();
        let id = session_id.to_string();
        let folder = match tokio::task::spawn_blocking(move || ensure_session_folder(&work_dir, &id))
            .await
        {
            Ok(Ok(folder)) => folder,
            Ok(Err(e)) => return failed_outcome(session_id, self.work_dir.join(session_id), e),
            Err(e) => return failed_outcome(session_id, self.work_dir.join(session_id), e),
        };

        let mut tracker = FileChangeTracker::new(&folder, self.exclude.clone());
        tracker.take_before_snapshot().await;

        let remote = match self.create_remote_session(&task.session_label()).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Could not create remote session: {}", e);
                drop(tracker);
                return TaskOutcome {
                    session_id: session_id.to_string(),
                    session_folder: folder,
                    invocation: InvocationResult::failure(REMOTE_SESSION_FAILED),
                    files: FileChanges::default(),
                };
            }
        };

        let invocation = self
            .send_message(&task.prompt(), selection, Some(&remote), &folder, sink)
            .await;
        let files = tracker
            .take_after_snapshot_with_reported(&invocation.moved_files)
            .await;

        TaskOutcome {
            session_id: session_id.to_string(),
            session_folder: folder,
            invocation,
            files,
        }
    }
}

fn failed_outcome(
    session_id: &str,
    session_folder: PathBuf,
    error: impl std::fmt::Display,
) -> TaskOutcome {
    log::error!("Session folder for {} unavailable: {}", session_id, error);
    TaskOutcome {
        session_id: session_id.to_string(),
        session_folder,
        invocation: InvocationResult::failure(format!(
            "Unexpected error while preparing the session folder: {}",
            error
        )),
        files: FileChanges::default(),
    }
}

/// Where an announced name points: absolute as given, relative names inside
/// the session folder (the agent's working directory).
fn announced_path(session_folder: &Path, name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        resolve_relative(session_folder, name)
    }
}

async fn read_mentioned_file(session_folder: &Path, name: &str) -> Option<String> {
    let path = announced_path(session_folder, name)?;
    tokio::fs::read_to_string(path).await.ok()
}

/// Bring announced files into the session folder and return their
/// session-relative paths. Files already inside are reported in place.
async fn relocate_mentions(session_folder: &Path, mentions: Vec<String>) -> Vec<String> {
    if mentions.is_empty() {
        return Vec::new();
    }
    let folder = session_folder.to_path_buf();
    let relocated = tokio::task::spawn_blocking(move || {
        let canonical_folder = std::fs::canonicalize(&folder).unwrap_or_else(|_| folder.clone());
        let mut reported = Vec::new();
        for name in mentions {
            let Some(path) = announced_path(&folder, &name) else {
                log::warn!("Ignoring announced path {}", name);
                continue;
            };
            if !path.is_file() {
                log::debug!("Announced file {} does not exist", name);
                continue;
            }
            let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if let Ok(inside) = canonical.strip_prefix(&canonical_folder) {
                reported.push(relative_string(inside));
                continue;
            }
            match move_into_session(&folder, &path) {
                Ok(target) => {
                    log::info!("Moved {} into {}", path.display(), folder.display());
                    if let Some(file_name) = target.file_name() {
                        reported.push(file_name.to_string_lossy().into_owned());
                    }
                }
                Err(e) => log::warn!("Could not move {} into the session: {}", name, e),
            }
        }
        reported
    })
    .await;

    relocated.unwrap_or_else(|e| {
        log::error!("Relocating announced files failed: {}", e);
        Vec::new()
    })
}

#[async_trait]
impl AgentService for AgentProxy {
    async fn providers(&self) -> ProviderCatalog {
        self.get_providers().await
    }

    async fn default_provider(&self) -> ModelSelection {
        self.get_default_provider().await
    }

    async fn run_task(
        &self,
        task: CodingTask,
        session_id: &str,
        selection: &ModelSelection,
        sink: &dyn ThinkingSink,
    ) -> TaskOutcome {
        self.execute(task, session_id, selection, sink).await
    }
}

#[async_trait]
impl DefaultProvider for AgentProxy {
    async fn default_selection(&self) -> ModelSelection {
        self.get_default_provider().await
    }
}
