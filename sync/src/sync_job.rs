//! Sync job execution: orphan deletion followed by a sequential copy loop

use std::path::{Path, PathBuf};
use std::sync::Arc;

use media_sync_core::{MediaEvent, SyncDiff, SyncJob, SyncProgress, SyncStatus, SyncSummary};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::progress::{format_bytes, TransferMeter};
use crate::scanner::resolve_under;

/// Process-wide slot holding the current (or last finished) sync job.
///
/// Starting a job is a check-and-set under one lock, so two concurrent
/// start requests can never both see an idle slot. Clearing the slot is how
/// a device disconnect cancels a running job: the runner notices at its
/// next between-files check.
#[derive(Debug, Clone, Default)]
pub struct SyncJobSlot {
    inner: Arc<Mutex<Option<SyncJob>>>,
}

impl SyncJobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a new job, rejecting if one is already syncing
    pub async fn try_begin(&self) -> Result<Uuid> {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(SyncJob::is_syncing) {
            return Err(SyncError::Conflict("sync already in progress".to_string()));
        }

        let job = SyncJob::started();
        let id = job.id;
        *slot = Some(job);
        Ok(id)
    }

    pub async fn snapshot(&self) -> Option<SyncJob> {
        self.inner.lock().await.clone()
    }

    pub async fn is_syncing(&self) -> bool {
        self.inner.lock().await.as_ref().is_some_and(SyncJob::is_syncing)
    }

    /// Whether `id` is still the job occupying the slot and still syncing
    pub async fn is_active(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .await
            .as_ref()
            .is_some_and(|job| job.id == id && job.is_syncing())
    }

    /// Drop whatever job is in the slot, returning it
    pub async fn clear(&self) -> Option<SyncJob> {
        self.inner.lock().await.take()
    }

    pub async fn set_progress(&self, id: Uuid, progress: SyncProgress) -> bool {
        self.update(id, |job| job.progress = Some(progress)).await
    }

    pub async fn complete(&self, id: Uuid, summary: SyncSummary) -> bool {
        self.update(id, |job| {
            job.status = SyncStatus::Complete;
            job.summary = Some(summary);
        })
        .await
    }

    pub async fn fail(&self, id: Uuid, message: impl Into<String>) -> bool {
        let message = message.into();
        self.update(id, |job| {
            job.status = SyncStatus::Error;
            job.error = Some(message);
        })
        .await
    }

    async fn update(&self, id: Uuid, apply: impl FnOnce(&mut SyncJob)) -> bool {
        let mut slot = self.inner.lock().await;
        match slot.as_mut() {
            Some(job) if job.id == id && job.is_syncing() => {
                apply(job);
                true
            }
            _ => false,
        }
    }
}

/// Terminal result of one runner invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Complete(SyncSummary),
    Failed(String),
    /// The slot was cleared (device gone) before the job finished
    Cancelled,
}

/// Executes one diff against one device root
#[derive(Debug, Clone)]
pub struct SyncJobRunner {
    library_root: PathBuf,
    device_root: PathBuf,
    slot: SyncJobSlot,
    events: EventBus,
}

impl SyncJobRunner {
    pub fn new(
        library_root: impl Into<PathBuf>,
        device_root: impl Into<PathBuf>,
        slot: SyncJobSlot,
        events: EventBus,
    ) -> Self {
        Self {
            library_root: library_root.into(),
            device_root: device_root.into(),
            slot,
            events,
        }
    }

    /// Run the job claimed as `job_id`.
    ///
    /// Orphan deletions are best-effort. The first copy failure ends the job
    /// in `error`; files already copied stay on the device.
    #[instrument(skip_all, fields(job_id = %job_id, device = %self.device_root.display()))]
    pub async fn run(&self, job_id: Uuid, diff: &SyncDiff, delete_orphans: &[String]) -> SyncOutcome {
        let mut meter = TransferMeter::new(diff.to_copy.len());
        info!(
            to_copy = diff.to_copy.len(),
            bytes = %format_bytes(diff.bytes_to_copy()),
            orphans_to_delete = delete_orphans.len(),
            "Sync job started"
        );

        // The device may have gone while the diff was computed
        if !self.slot.is_active(job_id).await {
            info!("Sync job cancelled before it started");
            return SyncOutcome::Cancelled;
        }

        for relative_path in delete_orphans {
            if self.delete_orphan(relative_path).await {
                meter.record_deletion();
            }
        }

        for entry in &diff.to_copy {
            if !self.slot.is_active(job_id).await {
                info!(copied = meter.copied(), "Sync job cancelled");
                return SyncOutcome::Cancelled;
            }

            let bytes = match self.copy_entry(&entry.relative_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    let message = e.to_string();
                    error!(file = %entry.relative_path, error = %message, "Sync job failed");
                    if self.slot.fail(job_id, message.clone()).await {
                        self.events.publish(MediaEvent::sync_failed(message.clone()));
                        return SyncOutcome::Failed(message);
                    }
                    return SyncOutcome::Cancelled;
                }
            };

            let progress = meter.record_copy(&entry.relative_path, bytes);
            if !self.slot.set_progress(job_id, progress.clone()).await {
                return SyncOutcome::Cancelled;
            }
            self.events.publish(MediaEvent::SyncProgress(progress));
        }

        let summary = meter.summary(diff.to_skip.len());
        if !self.slot.complete(job_id, summary.clone()).await {
            return SyncOutcome::Cancelled;
        }

        info!(
            copied = summary.copied,
            skipped = summary.skipped,
            deleted = summary.deleted,
            duration_seconds = summary.duration_seconds,
            "Sync job complete"
        );
        self.events.publish(MediaEvent::SyncComplete(summary.clone()));
        SyncOutcome::Complete(summary)
    }

    /// Returns true only when a file was actually removed
    async fn delete_orphan(&self, relative_path: &str) -> bool {
        let Some(path) = resolve_under(&self.device_root, relative_path) else {
            warn!(path = relative_path, "Refusing to delete path outside the device root");
            return false;
        };

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = relative_path, "Deleted orphan");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = relative_path, "Orphan already gone");
                false
            }
            Err(e) => {
                warn!(
                    error = %SyncError::deletion_error(&path, e.to_string()),
                    "Orphan deletion failed"
                );
                false
            }
        }
    }

    async fn copy_entry(&self, relative_path: &str) -> Result<u64> {
        let source = resolve_under(&self.library_root, relative_path)
            .ok_or_else(|| SyncError::path_error(relative_path, "Path escapes the library root"))?;
        let destination = resolve_under(&self.device_root, relative_path)
            .ok_or_else(|| SyncError::path_error(relative_path, "Path escapes the device root"))?;

        copy_file(&source, &destination).await
    }
}

async fn copy_file(source: &Path, destination: &Path) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            SyncError::copy_error(source, destination, format!("Failed to create parent directory: {}", e))
        })?;
    }

    fs::copy(source, destination)
        .await
        .map_err(|e| SyncError::copy_error(source, destination, format!("Failed to copy file: {}", e)))
}
