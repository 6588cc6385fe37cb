//! Shared subprocess helpers for the agent layer.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound on retained stderr, in bytes.
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// A running stderr drain and the text it has kept so far.
#[derive(Debug)]
pub struct StderrDrain {
    task: JoinHandle<()>,
    captured: Arc<Mutex<String>>,
}

impl StderrDrain {
    /// Wait for stderr to close, but not past `deadline`, and return the
    /// capture. A descendant still holding the pipe open at the deadline
    /// only costs the tail of the output.
    pub async fn finish_by(mut self, deadline: Instant) -> String {
        if tokio::time::timeout_at(deadline, &mut self.task).await.is_err() {
            log::warn!("stderr still open at deadline, keeping partial capture");
            self.task.abort();
        }
        std::mem::take(&mut *self.captured.lock())
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn a tokio task that drains stderr line-by-line, logging non-empty lines
/// and keeping up to `limit` bytes of it.
///
/// Prevents deadlock when the child process writes to stderr faster than we consume it.
pub fn spawn_stderr_drain(
    stderr: tokio::process::ChildStderr,
    label: &'static str,
    limit: usize,
) -> StderrDrain {
    let captured = Arc::new(Mutex::new(String::new()));
    let sink = captured.clone();
    let task = tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if !line.trim().is_empty() {
                        log::debug!("[{label} stderr] {}", line.trim());
                    }
                    let mut captured = sink.lock();
                    if captured.len() < limit {
                        let room = limit - captured.len();
                        let mut end = line.len().min(room);
                        while !line.is_char_boundary(end) {
                            end -= 1;
                        }
                        captured.push_str(&line[..end]);
                    }
                }
                Err(e) => {
                    log::debug!("[{label} stderr] read failed: {}", e);
                    break;
                }
            }
        }
    });
    StderrDrain { task, captured }
}
