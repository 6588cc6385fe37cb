//! Sending changed session files back to the chat.
//!
//! Small change sets go out file by file, larger ones as a single archive.

use std::path::Path;
use std::time::Duration;

use super::transport::{ChatId, ChatTransport, FilePayload, OutboundFile};
use crate::agent::types::{excerpt, ERROR_EXCERPT_CHARS};
use crate::archive::{
    create_archive, format_size, format_summary, plan_delivery, prepare_individual_files,
    ArchiveLimits, DeliveryPlan,
};
use crate::tracker::FileChanges;

/// Entries listed per section of the change summary.
pub const SUMMARY_MAX_DISPLAY: usize = 20;
/// Pause between consecutive individual file sends.
pub const FILE_SEND_DELAY: Duration = Duration::from_millis(500);
pub const ARCHIVE_FAILED_MESSAGE: &str = "Failed to create file archive.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    pub limits: ArchiveLimits,
    /// Largest file count still sent one by one.
    pub threshold: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub plan: Option<DeliveryPlan>,
    /// Files delivered, counting archive members.
    pub delivered: usize,
    pub failed_sends: usize,
}

/// Post the change summary, then the files themselves.
pub async fn deliver_changes(
    transport: &dyn ChatTransport,
    chat_id: ChatId,
    session_folder: &Path,
    changes: &FileChanges,
    options: DeliveryOptions,
) -> DeliveryReport {
    if changes.is_empty() {
        log::debug!("No files to send");
        return DeliveryReport::default();
    }
    let summary = format_summary(changes, session_folder, SUMMARY_MAX_DISPLAY);
    if let Err(e) = transport.send_text(chat_id, summary).await {
        log::warn!("Failed to send file summary: {}", e);
    }
    deliver_files(transport, chat_id, session_folder, &changes.all, options).await
}

/// Send session-relative `files` individually or archived, by count.
pub async fn deliver_files(
    transport: &dyn ChatTransport,
    chat_id: ChatId,
    session_folder: &Path,
    files: &[String],
    options: DeliveryOptions,
) -> DeliveryReport {
    if files.is_empty() {
        return DeliveryReport::default();
    }
    let plan = plan_delivery(files.len(), options.threshold);
    let mut report = match plan {
        DeliveryPlan::Individual => {
            send_individual(transport, chat_id, session_folder, files, options.limits).await
        }
        DeliveryPlan::Archive => {
            send_archive(transport, chat_id, session_folder, files, options.limits).await
        }
    };
    report.plan = Some(plan);
    report
}

async fn send_individual(
    transport: &dyn ChatTransport,
    chat_id: ChatId,
    session_folder: &Path,
    files: &[String],
    limits: ArchiveLimits,
) -> DeliveryReport {
    let prepared = prepare_individual_files(session_folder, files, limits).await;
    let mut report = DeliveryReport::default();
    if prepared.is_empty() {
        log::warn!("No files to send after filtering");
        return report;
    }
    log::info!("Sending {} individual files to chat {}", prepared.len(), chat_id);

    for (index, file) in prepared.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(FILE_SEND_DELAY).await;
        }
        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.relative.clone());
        let outbound = OutboundFile {
            file_name,
            caption: file.relative.clone(),
            payload: FilePayload::Path(file.path),
        };
        match transport.send_file(chat_id, outbound).await {
            Ok(()) => {
                log::debug!("Sent file: {}", file.relative);
                report.delivered += 1;
            }
            Err(e) => {
                log::error!("Failed to send file {}: {}", file.relative, e);
                report.failed_sends += 1;
            }
        }
    }
    report
}

async fn send_archive(
    transport: &dyn ChatTransport,
    chat_id: ChatId,
    session_folder: &Path,
    files: &[String],
    limits: ArchiveLimits,
) -> DeliveryReport {
    log::info!("Creating archive for {} files", files.len());
    let mut report = DeliveryReport::default();

    let Some(archive) = create_archive(session_folder, files, None, limits).await else {
        if let Err(e) = transport
            .send_text(chat_id, ARCHIVE_FAILED_MESSAGE.to_string())
            .await
        {
            log::error!("Failed to report archive failure: {}", e);
        }
        return report;
    };

    let size = format_size(archive.size());
    let caption = format!(
        "Session archive: {}\nFiles: {}\nSize: {}",
        archive.name, archive.files_added, size
    );
    let files_added = archive.files_added;
    let name = archive.name.clone();
    let outbound = OutboundFile {
        file_name: archive.name,
        caption,
        payload: FilePayload::Bytes(archive.bytes),
    };

    match transport.send_file(chat_id, outbound).await {
        Ok(()) => {
            log::info!("Sent archive '{}' with {} files ({})", name, files_added, size);
            report.delivered = files_added;
        }
        Err(e) => {
            log::error!("Failed to send archive: {}", e);
            report.failed_sends += 1;
            let notice = format!(
                "Failed to send the archive: {}",
                excerpt(&e.to_string(), ERROR_EXCERPT_CHARS)
            );
            if let Err(e) = transport.send_text(chat_id, notice).await {
                log::error!("Failed to report archive send failure: {}", e);
            }
        }
    }
    report
}
