//! Publishing a session's files to a git repository.
//!
//! The session's top-level files are copied to `<repo>/work_place/<session_id>/`,
//! committed, and pushed. Every git call runs with the repository as its own
//! working directory; the process working directory is never changed.

use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::PublishSettings;

const PUBLISH_SUBDIR: &str = "work_place";
const ERROR_EXCERPT_CHARS: usize = 200;

/// Why a publish did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum PublishFailure {
    /// The remote rejected our credentials.
    Authentication(String),
    Failed(String),
}

impl PublishFailure {
    pub fn message(&self) -> &str {
        match self {
            PublishFailure::Authentication(m) | PublishFailure::Failed(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub success: bool,
    pub files_copied: Vec<String>,
    pub error: Option<PublishFailure>,
}

impl PublishOutcome {
    fn failed(files_copied: Vec<String>, failure: PublishFailure) -> Self {
        Self {
            success: false,
            files_copied,
            error: Some(failure),
        }
    }
}

/// Classify a failed push from git's stderr.
pub fn classify_push_failure(stderr: &str) -> PublishFailure {
    let stderr = stderr.trim();
    if stderr.contains("could not read Username") || stderr.contains("Authentication failed") {
        let original: String = stderr.chars().take(ERROR_EXCERPT_CHARS).collect();
        PublishFailure::Authentication(format!(
            "Repository authentication failed.\n\n\
             To fix this:\n\
             1. Check that the deploy key has write access to the repository\n\
             2. Verify the SSH key is loaded: ssh-add -l\n\
             3. Test the SSH connection to the git host\n\
             4. Check the remote URL: git remote -v (it should use SSH)\n\n\
             Original error: {}",
            original
        ))
    } else {
        PublishFailure::Failed(format!("Push failed: {}", stderr))
    }
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

pub struct Publisher {
    settings: PublishSettings,
}

impl Publisher {
    pub fn new(settings: PublishSettings) -> Self {
        Self { settings }
    }

    pub fn repo_path(&self) -> &Path {
        &self.settings.repo_path
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> std::io::Result<GitOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(key) = self.settings.ssh_key_path.as_ref().filter(|k| k.exists()) {
            cmd.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o StrictHostKeyChecking=no", key.display()),
            );
        }

        let output = cmd.output().await?;
        let result = GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success {
            log::debug!("git {:?} failed: {}", args, result.stderr.trim());
        }
        Ok(result)
    }

    pub async fn publish(&self, session_id: &str, session_folder: &Path) -> PublishOutcome {
        log::info!("Publishing session {}", session_id);
        match self.try_publish(session_id, session_folder).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Publish of {} failed: {}", session_id, e);
                PublishOutcome::failed(Vec::new(), PublishFailure::Failed(format!("Publish error: {}", e)))
            }
        }
    }

    async fn try_publish(
        &self,
        session_id: &str,
        session_folder: &Path,
    ) -> std::io::Result<PublishOutcome> {
        if !session_folder.is_dir() {
            return Ok(PublishOutcome::failed(
                Vec::new(),
                PublishFailure::Failed("Session folder not found".to_string()),
            ));
        }
        let sources = top_level_files(session_folder).await?;
        if sources.is_empty() {
            log::warn!("No files to publish in session {}", session_id);
            return Ok(PublishOutcome::failed(
                Vec::new(),
                PublishFailure::Failed("No files to publish".to_string()),
            ));
        }

        let repo = self.settings.repo_path.clone();
        if !repo.join(".git").exists() {
            if let Some(failure) = self.clone_repo(&repo).await? {
                return Ok(PublishOutcome::failed(Vec::new(), failure));
            }
        }

        let target_dir = repo.join(PUBLISH_SUBDIR).join(session_id);
        tokio::fs::create_dir_all(&target_dir).await?;
        let mut files_copied = Vec::new();
        for source in &sources {
            let Some(name) = source.file_name() else {
                continue;
            };
            tokio::fs::copy(source, target_dir.join(name)).await?;
            files_copied.push(name.to_string_lossy().into_owned());
        }
        log::info!("Copied {} files to {}", files_copied.len(), target_dir.display());

        self.git(&repo, &["config", "user.email", &self.settings.git_user_email])
            .await?;
        self.git(&repo, &["config", "user.name", &self.settings.git_user_name])
            .await?;
        if !self.git(&repo, &["rev-parse", "--verify", "HEAD"]).await?.success {
            self.initial_commit(&repo).await?;
        }

        let relative_target = format!("{}/{}", PUBLISH_SUBDIR, session_id);
        self.git(&repo, &["add", &relative_target]).await?;
        let message = format!("Add session {} - {}", session_id, Local::now().to_rfc3339());
        let commit = self.git(&repo, &["commit", "-m", &message]).await?;
        if !commit.success {
            log::warn!("Nothing committed: {}", commit.stderr.trim());
        }

        let branch = self.git(&repo, &["branch", "--show-current"]).await?;
        let branch = match branch.stdout.trim() {
            "" => "main".to_string(),
            name => name.to_string(),
        };

        if !self
            .git(&repo, &["pull", "--rebase", "origin", &branch])
            .await?
            .success
        {
            let plain = self.git(&repo, &["pull", "origin", &branch]).await?;
            if !plain.success {
                log::warn!("Pull before push failed: {}", plain.stderr.trim());
            }
        }

        let mut push = self.git(&repo, &["push", "-u", "origin", &branch]).await?;
        if !push.success {
            log::warn!("Push with upstream failed, retrying plain push");
            push = self.git(&repo, &["push"]).await?;
        }
        if !push.success {
            log::error!("Push failed: {}", push.stderr.trim());
            return Ok(PublishOutcome::failed(
                files_copied,
                classify_push_failure(&push.stderr),
            ));
        }

        log::info!("Published session {} ({} files)", session_id, files_copied.len());
        Ok(PublishOutcome {
            success: true,
            files_copied,
            error: None,
        })
    }

    async fn clone_repo(&self, repo: &Path) -> std::io::Result<Option<PublishFailure>> {
        let Some(remote) = self.settings.remote_url.as_deref() else {
            return Ok(Some(PublishFailure::Failed(format!(
                "Repository not found at {} and no remote is configured",
                repo.display()
            ))));
        };
        let parent = match repo.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&parent).await?;

        let repo_arg = repo.to_string_lossy();
        let cwd = std::env::current_dir()?;
        let clone = self.git(&cwd, &["clone", remote, &repo_arg]).await?;
        if clone.success {
            log::info!("Cloned {} into {}", remote, repo.display());
            Ok(None)
        } else {
            Ok(Some(PublishFailure::Failed(format!(
                "Failed to clone repository: {}",
                clone.stderr.trim()
            ))))
        }
    }

    async fn initial_commit(&self, repo: &Path) -> std::io::Result<()> {
        let readme = repo.join("README.md");
        if !readme.exists() {
            tokio::fs::write(&readme, "# Session files\n\nFiles published from agent sessions.\n")
                .await?;
            self.git(repo, &["add", "README.md"]).await?;
        }
        self.git(repo, &["commit", "-m", "Initial commit"]).await?;
        Ok(())
    }
}

async fn top_level_files(folder: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
