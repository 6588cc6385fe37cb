//! Packaging changed session files for delivery.
//!
//! Files go out either one by one ([`prepare_individual_files`]) or bundled
//! into a size-bounded zip ([`create_archive`]). [`plan_delivery`] picks between
//! the two from the changed-file count.

use chrono::Local;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::tracker::FileChanges;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Size and count caps shared by both delivery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_file_size: u64,
    pub max_archive_size: u64,
    pub max_individual_files: usize,
}

/// A built archive held in memory.
#[derive(Debug, Clone)]
pub struct Archive {
    pub name: String,
    pub bytes: Vec<u8>,
    pub files_added: usize,
}

impl Archive {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A file that passed the existence and size checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndividualFile {
    pub path: PathBuf,
    pub relative: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPlan {
    Individual,
    Archive,
}

/// Send individually up to `threshold` files, archive beyond that.
pub fn plan_delivery(file_count: usize, threshold: usize) -> DeliveryPlan {
    if file_count <= threshold {
        DeliveryPlan::Individual
    } else {
        DeliveryPlan::Archive
    }
}

/// `session_<folder>_<YYYYmmdd_HHMMSS>.zip`
pub fn default_archive_name(session_folder: &Path) -> String {
    let folder = session_folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "files".to_string());
    format!("session_{}_{}.zip", folder, Local::now().format("%Y%m%d_%H%M%S"))
}

/// Zip the given session-relative files. Unreadable and oversized files are
/// skipped; adding stops once the estimated archive size would pass the cap.
/// Returns `None` when no file qualifies or the archive could not be built.
pub async fn create_archive(
    session_folder: &Path,
    files: &[String],
    name: Option<String>,
    limits: ArchiveLimits,
) -> Option<Archive> {
    let folder = session_folder.to_path_buf();
    let files = files.to_vec();
    let name = name.unwrap_or_else(|| default_archive_name(session_folder));

    let built = tokio::task::spawn_blocking(move || build_archive(&folder, &files, name, limits))
        .await;
    match built {
        Ok(Ok(archive)) => archive,
        Ok(Err(e)) => {
            log::error!("Failed to build archive: {}", e);
            None
        }
        Err(e) => {
            log::error!("Archive task failed: {}", e);
            None
        }
    }
}

fn build_archive(
    session_folder: &Path,
    files: &[String],
    name: String,
    limits: ArchiveLimits,
) -> Result<Option<Archive>, ArchiveError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut total_size: u64 = 0;
    let mut files_added = 0;

    for relative in files {
        let Some(path) = resolve_relative(session_folder, relative) else {
            log::warn!("Skipping path outside the session folder: {}", relative);
            continue;
        };
        let size = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                log::warn!("Skipping missing file: {}", relative);
                continue;
            }
        };
        if size > limits.max_file_size {
            log::warn!(
                "Skipping {} ({}), over the per-file cap",
                relative,
                format_size(size)
            );
            continue;
        }

        let estimated = total_size + size / 2;
        if estimated > limits.max_archive_size {
            log::warn!(
                "Archive size cap reached after {} files, stopping at {}",
                files_added,
                relative
            );
            break;
        }

        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Skipping unreadable file {}: {}", relative, e);
                continue;
            }
        };
        writer.start_file(relative.as_str(), options)?;
        writer.write_all(&content)?;
        total_size += size;
        files_added += 1;
    }

    if files_added == 0 {
        log::warn!("No files qualified for the archive");
        return Ok(None);
    }

    let bytes = writer.finish()?.into_inner();
    log::info!(
        "Built archive {} with {} files ({})",
        name,
        files_added,
        format_size(bytes.len() as u64)
    );
    Ok(Some(Archive {
        name,
        bytes,
        files_added,
    }))
}

/// Filter files for one-by-one sending, keeping at most
/// `limits.max_individual_files`.
pub async fn prepare_individual_files(
    session_folder: &Path,
    files: &[String],
    limits: ArchiveLimits,
) -> Vec<IndividualFile> {
    let mut prepared = Vec::new();
    for relative in files {
        if prepared.len() >= limits.max_individual_files {
            log::info!(
                "Individual file limit ({}) reached",
                limits.max_individual_files
            );
            break;
        }
        let Some(path) = resolve_relative(session_folder, relative) else {
            log::warn!("Skipping path outside the session folder: {}", relative);
            continue;
        };
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                log::warn!("Skipping missing file: {}", relative);
                continue;
            }
        };
        if size > limits.max_file_size {
            log::warn!(
                "Skipping {} ({}), over the per-file cap",
                relative,
                format_size(size)
            );
            continue;
        }
        prepared.push(IndividualFile {
            path,
            relative: relative.clone(),
            size,
        });
    }
    prepared
}

/// Join a session-relative path onto the folder, refusing anything that
/// could escape it.
pub fn resolve_relative(session_folder: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative);
    if relative.is_empty()
        || candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(session_folder.join(candidate))
}

/// Human-readable size with binary units, e.g. `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

/// Summary of a change set: per-section counts, up to `max_display` entries
/// per section with sizes, and a total.
pub fn format_summary(changes: &FileChanges, session_folder: &Path, max_display: usize) -> String {
    if changes.is_empty() {
        return "No files were created or modified.".to_string();
    }

    let mut lines = vec![format!("Changed files ({}):", changes.len())];
    let mut total: u64 = 0;

    for (title, files) in [("Created", &changes.created), ("Modified", &changes.modified)] {
        if files.is_empty() {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("{} ({}):", title, files.len()));
        for (index, relative) in files.iter().enumerate() {
            let size = resolve_relative(session_folder, relative)
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len());
            total += size.unwrap_or(0);
            if index < max_display {
                match size {
                    Some(size) => lines.push(format!("  • {} - {}", relative, format_size(size))),
                    None => lines.push(format!("  • {} - missing", relative)),
                }
            }
        }
        if files.len() > max_display {
            lines.push(format!("  ...and {} more", files.len() - max_display));
        }
    }

    lines.push(String::new());
    lines.push(format!("Total: {} files, {}", changes.len(), format_size(total)));
    lines.join("\n")
}
