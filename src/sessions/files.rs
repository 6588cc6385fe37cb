//! On-disk layout of a session: `<work_dir>/<session_id>/`, holding the
//! agent's artifacts and an append-only `proc.md` transcript.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Transcript file name inside every session folder.
pub const TRANSCRIPT_FILE: &str = "proc.md";

#[derive(Error, Debug)]
pub enum SessionFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid file name: {0}")]
    InvalidName(String),
    #[error("File not found: {0}")]
    NotFound(String),
}

/// A top-level file in a session folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFile {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

pub fn session_folder_path(work_dir: &Path, session_id: &str) -> PathBuf {
    work_dir.join(session_id)
}

pub fn ensure_session_folder(work_dir: &Path, session_id: &str) -> Result<PathBuf, SessionFileError> {
    let folder = session_folder_path(work_dir, session_id);
    fs::create_dir_all(&folder)?;
    Ok(folder)
}

/// Resolve a plain file name inside the folder. Separators, `..` and hidden
/// names are rejected.
fn resolve_file(folder: &Path, name: &str) -> Result<PathBuf, SessionFileError> {
    let name = name.trim();
    let mut components = Path::new(name).components();
    let valid = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !name.starts_with('.');
    if !valid {
        return Err(SessionFileError::InvalidName(name.to_string()));
    }
    Ok(folder.join(name))
}

pub fn format_transcript_entry(
    timestamp: DateTime<Utc>,
    request: &str,
    response: &str,
    thinking: &[String],
) -> String {
    let mut entry = format!(
        "## {}\n\n### Request\n```\n{}\n```\n\n### Response\n```\n{}\n```\n",
        timestamp.to_rfc3339(),
        request,
        response
    );
    if !thinking.is_empty() {
        entry.push_str("\n### Thinking Blocks\n");
        for (index, block) in thinking.iter().enumerate() {
            entry.push_str(&format!("\n{}. {}\n", index + 1, block));
        }
    }
    entry.push_str("\n---\n\n");
    entry
}

pub fn append_transcript(
    folder: &Path,
    request: &str,
    response: &str,
    thinking: &[String],
) -> Result<(), SessionFileError> {
    fs::create_dir_all(folder)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(folder.join(TRANSCRIPT_FILE))?;
    file.write_all(format_transcript_entry(Utc::now(), request, response, thinking).as_bytes())?;
    Ok(())
}

/// Move `source` into the folder under its own file name, falling back to
/// copy + delete when a rename is not possible (e.g. across filesystems).
/// A same-named file already in the folder is replaced. Returns the new
/// location.
pub fn move_into_session(folder: &Path, source: &Path) -> Result<PathBuf, SessionFileError> {
    let name = source
        .file_name()
        .ok_or_else(|| SessionFileError::InvalidName(source.display().to_string()))?;
    if !source.is_file() {
        return Err(SessionFileError::NotFound(source.display().to_string()));
    }
    fs::create_dir_all(folder)?;
    let target = folder.join(name);
    if target.exists() {
        log::warn!(
            "{} replaces an existing session file {}",
            source.display(),
            target.display()
        );
    }

    if let Err(e) = fs::rename(source, &target) {
        log::debug!(
            "Rename of {} failed ({}), copying instead",
            source.display(),
            e
        );
        fs::copy(source, &target)?;
        fs::remove_file(source)?;
    }
    Ok(target)
}

/// Top-level regular files, oldest first. The transcript and hidden files are
/// not listed.
pub fn list_files(folder: &Path) -> Result<Vec<SessionFile>, SessionFileError> {
    if !folder.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Skipping unreadable entry in {}: {}", folder.display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == TRANSCRIPT_FILE || name.starts_with('.') {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        files.push(SessionFile {
            name,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

/// Read a file as text. `Ok(None)` when it does not exist.
pub fn read_file(folder: &Path, name: &str) -> Result<Option<String>, SessionFileError> {
    let path = resolve_file(folder, name)?;
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Write a file atomically, creating or replacing it.
pub fn save_file(folder: &Path, name: &str, content: &str) -> Result<PathBuf, SessionFileError> {
    let path = resolve_file(folder, name)?;
    fs::create_dir_all(folder)?;

    // Write to temp file, then atomic rename
    let mut temp_file = NamedTempFile::new_in(folder)?;
    temp_file.write_all(content.as_bytes())?;
    temp_file
        .persist(&path)
        .map_err(|e| SessionFileError::Io(e.error))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn folder_path_is_deterministic() {
        let work = Path::new("work_place");
        assert_eq!(
            session_folder_path(work, "abc"),
            session_folder_path(work, "abc")
        );
        assert_eq!(session_folder_path(work, "abc"), PathBuf::from("work_place/abc"));
    }

    #[test]
    fn transcript_entry_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let entry = format_transcript_entry(
            ts,
            "write hello",
            "print('hi')",
            &["plan".to_string(), "check".to_string()],
        );
        assert!(entry.starts_with("## 2024-05-01T12:00:00+00:00\n"));
        assert!(entry.contains("### Request\n```\nwrite hello\n```"));
        assert!(entry.contains("### Response\n```\nprint('hi')\n```"));
        assert!(entry.contains("\n1. plan\n"));
        assert!(entry.contains("\n2. check\n"));
        assert!(entry.ends_with("---\n\n"));
    }

    #[test]
    fn transcript_appends() {
        let dir = TempDir::new().unwrap();
        append_transcript(dir.path(), "one", "1", &[]).unwrap();
        append_transcript(dir.path(), "two", "2", &[]).unwrap();
        let content = fs::read_to_string(dir.path().join(TRANSCRIPT_FILE)).unwrap();
        assert_eq!(content.matches("### Request").count(), 2);
        assert!(!content.contains("Thinking Blocks"));
    }

    #[test]
    fn save_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let content = "def f():\n    return 'ünïcode'\n";
        save_file(dir.path(), "f.py", content).unwrap();
        assert_eq!(read_file(dir.path(), "f.py").unwrap().as_deref(), Some(content));

        save_file(dir.path(), "f.py", "x = 1\n").unwrap();
        let listed = list_files(dir.path()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 6);
    }

    #[test]
    fn names_cannot_escape_the_folder() {
        let dir = TempDir::new().unwrap();
        for bad in ["../x.py", "/etc/passwd", "sub/x.py", ".env", ""] {
            assert!(
                matches!(
                    save_file(dir.path(), bad, "x"),
                    Err(SessionFileError::InvalidName(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn read_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_file(dir.path(), "nope.txt").unwrap(), None);
    }

    #[test]
    fn list_skips_transcript_hidden_and_dirs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.py"), "a").unwrap();
        fs::write(dir.path().join(TRANSCRIPT_FILE), "log").unwrap();
        fs::write(dir.path().join(".secret"), "s").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let names: Vec<_> = list_files(dir.path())
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["a.py"]);
    }

    #[test]
    fn move_into_session_relocates_file() {
        let outside = TempDir::new().unwrap();
        let session = TempDir::new().unwrap();
        let source = outside.path().join("made.py");
        fs::write(&source, "print(1)").unwrap();

        let target = move_into_session(session.path(), &source).unwrap();
        assert_eq!(target, session.path().join("made.py"));
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(target).unwrap(), "print(1)");
    }

    #[test]
    fn move_into_session_replaces_same_named_file() {
        let outside = TempDir::new().unwrap();
        let session = TempDir::new().unwrap();
        fs::write(session.path().join("made.py"), "old").unwrap();
        let source = outside.path().join("made.py");
        fs::write(&source, "new").unwrap();

        let target = move_into_session(session.path(), &source).unwrap();
        assert_eq!(fs::read_to_string(target).unwrap(), "new");
        assert!(!source.exists());
    }

    #[test]
    fn move_missing_source_fails() {
        let session = TempDir::new().unwrap();
        assert!(matches!(
            move_into_session(session.path(), Path::new("/nonexistent/x.py")),
            Err(SessionFileError::NotFound(_))
        ));
    }
}
