//! Agent CLI subprocess driver.
//!
//! Spawns `<command> run --format json --thinking ...` inside the session
//! folder, streams stdout line by line, forwards thinking blocks to a
//! [`ThinkingSink`] as they arrive, and drains stderr concurrently. The whole
//! run, from spawn to exit, is bounded by one timeout; on expiry the child is
//! killed.

use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::protocol::{classify_line, AgentEvent};
use super::sink::ThinkingSink;
use super::types::{excerpt, AgentError, ModelSelection};
use super::utils::{spawn_stderr_drain, STDERR_CAPTURE_LIMIT};

/// Windows constant to hide console windows when spawning CLI subprocesses.
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// One CLI call.
#[derive(Debug, Clone, Copy)]
pub struct CliInvocation<'a> {
    pub prompt: &'a str,
    pub selection: &'a ModelSelection,
    /// Remote session to continue, if any.
    pub remote_session_id: Option<&'a str>,
    /// Working directory of the child; the parent's is left alone.
    pub working_dir: &'a Path,
}

/// Everything collected from a run that exited successfully.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    pub thinking: Vec<String>,
    pub text_parts: Vec<String>,
    pub events: Vec<Value>,
    pub stdout: String,
    pub stderr: String,
}

pub struct CliRunner {
    command: String,
    timeout: Duration,
}

impl CliRunner {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn build_args(invocation: &CliInvocation<'_>) -> Vec<String> {
        let mut args: Vec<String> = ["run", "--format", "json", "--thinking"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(model) = invocation.selection.cli_model_arg() {
            args.push("-m".to_string());
            args.push(model);
        }
        if let Some(session) = invocation.remote_session_id.filter(|s| !s.is_empty()) {
            args.push("-s".to_string());
            args.push(session.to_string());
        }
        args.push(invocation.prompt.to_string());
        args
    }

    pub async fn run(
        &self,
        invocation: &CliInvocation<'_>,
        sink: &dyn ThinkingSink,
    ) -> Result<RunOutput, AgentError> {
        let args = Self::build_args(invocation);
        log::info!(
            "Running {} in {} (model: {}, prompt: '{}')",
            self.command,
            invocation.working_dir.display(),
            invocation.selection.label(),
            excerpt(invocation.prompt, 50)
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&args)
            .current_dir(invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut child = cmd.spawn().map_err(|source| AgentError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::InvalidResponse("stdout was not captured".to_string()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_drain(stderr, "agent", STDERR_CAPTURE_LIMIT));

        let mut output = RunOutput::default();
        let streamed = tokio::time::timeout_at(deadline, async {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf);
                if output.stdout.len() < STDERR_CAPTURE_LIMIT {
                    output.stdout.push_str(&line);
                }
                match classify_line(&line) {
                    Ok(Some(parsed)) => {
                        match parsed.event {
                            AgentEvent::Thinking(text) => {
                                if let Err(e) = sink.on_thinking(&text).await {
                                    log::warn!("Thinking sink failed: {}", e);
                                }
                                output.thinking.push(text);
                            }
                            AgentEvent::Text(text) => output.text_parts.push(text),
                            AgentEvent::Other => {}
                        }
                        output.events.push(parsed.raw);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("Skipping non-JSON line ({}): {}", e, excerpt(line.trim(), 100));
                    }
                }
            }
            Ok::<_, AgentError>(child.wait().await?)
        })
        .await;

        let status = match streamed {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(e);
            }
            Err(_) => {
                log::warn!("Agent run exceeded {:?}, killing it", self.timeout);
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(AgentError::Timeout(self.timeout));
            }
        };

        if let Some(drain) = stderr_task {
            output.stderr = drain.finish_by(deadline).await;
        }

        log::info!(
            "Agent exited with {} ({} thinking blocks, {} text parts, {} events)",
            status,
            output.thinking.len(),
            output.text_parts.len(),
            output.events.len()
        );

        if !status.success() {
            return Err(AgentError::Exit {
                status: status.to_string(),
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::sink::{ChannelSink, NoopSink, SinkError};
    use crate::agent::test_support::fake_agent;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn invocation<'a>(dir: &'a Path, selection: &'a ModelSelection) -> CliInvocation<'a> {
        CliInvocation {
            prompt: "write hello",
            selection,
            remote_session_id: None,
            working_dir: dir,
        }
    }

    #[test]
    fn args_include_model_session_and_prompt_last() {
        let selection = ModelSelection::new("anthropic", "claude");
        let args = CliRunner::build_args(&CliInvocation {
            prompt: "do it",
            selection: &selection,
            remote_session_id: Some("ses_1"),
            working_dir: Path::new("."),
        });
        assert_eq!(
            args,
            vec!["run", "--format", "json", "--thinking", "-m", "anthropic/claude", "-s", "ses_1", "do it"]
        );

        let bare = ModelSelection::default();
        let args = CliRunner::build_args(&CliInvocation {
            prompt: "p",
            selection: &bare,
            remote_session_id: Some(""),
            working_dir: Path::new("."),
        });
        assert_eq!(args, vec!["run", "--format", "json", "--thinking", "p"]);
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(
            &scripts,
            r#"echo '{"type":"thinking","text":"first"}'
echo 'garbage here'
echo '{"type":"text","part":{"text":"hello"}}'
echo '{"type":'
echo '{"type":"step_finish","part":{"text":"second"}}'
echo '{"type":"text","part":{"text":"world"}}'"#,
        );
        let selection = ModelSelection::default();
        let (sink, mut rx) = ChannelSink::new();

        let output = CliRunner::new(command, Duration::from_secs(10))
            .run(&invocation(work.path(), &selection), &sink)
            .await
            .unwrap();

        assert_eq!(output.thinking, vec!["first", "second"]);
        assert_eq!(output.text_parts, vec!["hello", "world"]);
        assert_eq!(output.events.len(), 4);
        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        assert_eq!(rx.recv().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn child_runs_in_working_dir() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(&scripts, "echo made > created.txt");
        let cwd_before = std::env::current_dir().unwrap();
        let selection = ModelSelection::default();

        CliRunner::new(command, Duration::from_secs(10))
            .run(&invocation(work.path(), &selection), &NoopSink)
            .await
            .unwrap();

        assert!(work.path().join("created.txt").is_file());
        assert_eq!(std::env::current_dir().unwrap(), cwd_before);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(&scripts, "echo '{\"type\":\"thinking\",\"text\":\"t\"}'\nsleep 30");
        let cwd_before = std::env::current_dir().unwrap();
        let selection = ModelSelection::default();

        let err = CliRunner::new(command, Duration::from_millis(300))
            .run(&invocation(work.path(), &selection), &NoopSink)
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::Timeout(_)));
        assert_eq!(std::env::current_dir().unwrap(), cwd_before);
    }

    #[tokio::test]
    async fn background_stderr_holder_does_not_outlive_timeout() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(
            &scripts,
            r#"sleep 6 >/dev/null &
echo 'warming up' >&2
echo '{"type":"text","part":{"text":"done"}}'"#,
        );
        let selection = ModelSelection::default();

        let started = std::time::Instant::now();
        let output = CliRunner::new(command, Duration::from_millis(500))
            .run(&invocation(work.path(), &selection), &NoopSink)
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(output.text_parts, vec!["done"]);
        assert_eq!(output.stderr, "warming up\n");
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(&scripts, "echo 'model not found' >&2\nexit 3");
        let selection = ModelSelection::default();

        let err = CliRunner::new(command, Duration::from_secs(10))
            .run(&invocation(work.path(), &selection), &NoopSink)
            .await
            .unwrap_err();

        match err {
            AgentError::Exit { stderr, .. } => assert!(stderr.contains("model not found")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let work = TempDir::new().unwrap();
        let selection = ModelSelection::default();
        let err = CliRunner::new("/nonexistent/agent-binary", Duration::from_secs(1))
            .run(&invocation(work.path(), &selection), &NoopSink)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }

    struct FailingSink;

    #[async_trait]
    impl ThinkingSink for FailingSink {
        async fn on_thinking(&self, _text: &str) -> Result<(), SinkError> {
            Err("chat unavailable".into())
        }
    }

    #[tokio::test]
    async fn sink_errors_do_not_abort_the_run() {
        let scripts = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let command = fake_agent(
            &scripts,
            r#"echo '{"type":"reasoning","part":{"text":"r"}}'
echo '{"type":"text","part":{"text":"done"}}'"#,
        );
        let selection = ModelSelection::default();

        let output = CliRunner::new(command, Duration::from_secs(10))
            .run(&invocation(work.path(), &selection), &FailingSink)
            .await
            .unwrap();
        assert_eq!(output.thinking, vec!["r"]);
        assert_eq!(output.text_parts, vec!["done"]);
    }
}
