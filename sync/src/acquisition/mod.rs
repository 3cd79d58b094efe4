//! Acquisition job queue.
//!
//! Submissions are persisted as `pending` jobs and run one at a time in
//! submission order. Each job drives a [`DownloadExecutor`], places the result
//! in the library tree and registers it in the catalog. The next job is
//! dispatched when the running one reaches `complete` or `error`.

mod executor;
mod thumbnail;
mod transcript;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use media_sync_core::events::DownloadComplete;
use media_sync_core::{
    AcquisitionJob, AcquisitionRequest, AcquisitionStatus, CatalogEntry, MediaEvent, MediaMetadata, NewCatalogEntry,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::catalog::{CatalogStore, JobStore};
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::library::place_in_library;

pub use executor::{parse_metadata, DownloadExecutor, DownloaderOptions, YtDlpExecutor};
pub use thumbnail::{video_id, ThumbnailCache, THUMBNAIL_DIR};
pub use transcript::{DownloadUpdate, TranscriptParser, CONVERTING_PERCENT};

/// Message pushed to observers when the downloader itself fails
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Download failed";

/// Check a submission before anything is persisted
pub fn validate_request(request: &AcquisitionRequest) -> Result<()> {
    validate_url(&request.url)?;
    if request.title.trim().is_empty() {
        return Err(SyncError::invalid_input("title", "must not be empty"));
    }
    if request.artist.trim().is_empty() {
        return Err(SyncError::invalid_input("artist", "must not be empty"));
    }
    Ok(())
}

/// Only absolute http(s) URLs are accepted
pub fn validate_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| SyncError::invalid_input("url", e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        scheme => Err(SyncError::invalid_input(
            "url",
            format!("unsupported scheme '{}', expected http or https", scheme),
        )),
    }
}

#[derive(Debug)]
struct QueuedJob {
    job: AcquisitionJob,
    request: AcquisitionRequest,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    active: Option<i64>,
}

struct QueueInner {
    catalog: Arc<dyn CatalogStore>,
    jobs: Arc<dyn JobStore>,
    executor: Arc<dyn DownloadExecutor>,
    events: EventBus,
    library_root: PathBuf,
    thumbnails: ThumbnailCache,
    state: Mutex<QueueState>,
}

/// Single-concurrency FIFO of acquisition jobs
#[derive(Clone)]
pub struct AcquisitionQueue {
    inner: Arc<QueueInner>,
}

impl AcquisitionQueue {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        jobs: Arc<dyn JobStore>,
        executor: Arc<dyn DownloadExecutor>,
        events: EventBus,
        library_root: impl Into<PathBuf>,
    ) -> Self {
        let library_root = library_root.into();
        let thumbnails = ThumbnailCache::in_library(&library_root);
        Self {
            inner: Arc::new(QueueInner {
                catalog,
                jobs,
                executor,
                events,
                library_root,
                thumbnails,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Id of the job whose downloader is running, if any
    pub fn active_job(&self) -> Option<i64> {
        self.inner.state.lock().active
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Persist a new `pending` job and queue it. Returns immediately; the
    /// download runs in the background.
    #[instrument(skip_all, fields(url = %request.url))]
    pub async fn submit(&self, request: AcquisitionRequest) -> Result<AcquisitionJob> {
        validate_request(&request)?;

        let job = self.inner.jobs.insert_job(request.url.trim()).await?;
        info!(job_id = job.id, title = %request.title, "Acquisition job queued");

        self.inner.state.lock().pending.push_back(QueuedJob {
            job: job.clone(),
            request,
        });
        self.dispatch_next();
        Ok(job)
    }

    /// Look up metadata for `url` and cache its thumbnail
    pub async fn prefetch(&self, url: &str) -> Result<MediaMetadata> {
        let url = validate_url(url)?;
        let metadata = self.inner.executor.probe_metadata(url.as_str()).await?;

        if let (Some(id), Some(thumbnail_url)) = (&metadata.video_id, &metadata.thumbnail_url) {
            match self.inner.thumbnails.fetch(id, thumbnail_url).await {
                Ok(true) => {}
                Ok(false) => debug!(video_id = %id, "Thumbnail not cached"),
                Err(e) => warn!(video_id = %id, error = %e, "Thumbnail fetch failed"),
            }
        }
        Ok(metadata)
    }

    /// Start the next pending job unless one is already running
    fn dispatch_next(&self) {
        let next = {
            let mut state = self.inner.state.lock();
            if state.active.is_some() {
                return;
            }
            let Some(next) = state.pending.pop_front() else {
                return;
            };
            state.active = Some(next.job.id);
            next
        };

        let queue = self.clone();
        tokio::spawn(async move {
            let job = next.job.clone();
            let outcome = tokio::spawn(queue.clone().run_job(next)).await;
            if let Err(e) = outcome {
                queue.abandon(job.clone(), &e).await;
            }
            queue.finish(job.id);
        });
    }

    /// Release the active slot held by `job_id` and start the next job.
    /// Does nothing to the slot once another job holds it.
    fn finish(&self, job_id: i64) {
        {
            let mut state = self.inner.state.lock();
            if state.active == Some(job_id) {
                state.active = None;
            }
        }
        self.dispatch_next();
    }

    /// Record a job whose task panicked or was aborted as failed
    async fn abandon(&self, mut job: AcquisitionJob, cause: &tokio::task::JoinError) {
        let message = format!("acquisition task ended abnormally: {}", cause);
        error!(job_id = job.id, error = %message, "Acquisition job aborted");
        job.status = AcquisitionStatus::Error;
        job.error_message = Some(message);
        self.persist(&job).await;
        self.inner
            .events
            .publish(MediaEvent::download_failed(job.id, DOWNLOAD_FAILED_MESSAGE));
    }

    async fn run_job(self, queued: QueuedJob) {
        let QueuedJob { mut job, request } = queued;
        let job_id = job.id;

        match self.execute(&mut job, &request).await {
            Ok(entry) => {
                job.status = AcquisitionStatus::Complete;
                job.progress_percent = 100;
                job.result_entry_id = Some(entry.id);
                self.persist(&job).await;
                info!(job_id, entry_id = entry.id, path = %entry.file_path.display(), "Acquisition job complete");
                self.inner
                    .events
                    .publish(MediaEvent::DownloadComplete(DownloadComplete { job_id, entry }));
            }
            Err(e) => {
                let (stored, pushed) = failure_messages(&e);
                error!(job_id, error = %stored, "Acquisition job failed");
                job.status = AcquisitionStatus::Error;
                job.error_message = Some(stored);
                self.persist(&job).await;
                self.inner.events.publish(MediaEvent::download_failed(job_id, pushed));
            }
        }

        self.finish(job_id);
    }

    /// Download, place and register one job. The temp file is left behind
    /// on failure.
    async fn execute(&self, job: &mut AcquisitionJob, request: &AcquisitionRequest) -> Result<CatalogEntry> {
        self.advance(job, DownloadUpdate::downloading(0)).await;

        let (tx, mut rx) = mpsc::channel(64);
        let download = self.inner.executor.run(job.id, request.url.trim(), tx);
        let track = async {
            while let Some(update) = rx.recv().await {
                self.advance(job, update).await;
            }
        };
        let (downloaded, ()) = tokio::join!(download, track);
        let temp_file = downloaded?;

        let file_path = place_in_library(
            &temp_file,
            &self.inner.library_root,
            request.category,
            request.artist.trim(),
            request.title.trim(),
        )
        .await?;

        let thumbnail_ref = match video_id(&request.url) {
            Some(id) => self.inner.thumbnails.reference(&id).await,
            None => None,
        };

        self.inner
            .catalog
            .insert(&NewCatalogEntry {
                title: request.title.trim().to_string(),
                artist: request.artist.trim().to_string(),
                category: request.category,
                duration_seconds: request.duration_seconds.unwrap_or(0),
                file_path,
                thumbnail_ref,
                source_url: Some(request.url.trim().to_string()),
            })
            .await
    }

    /// Apply a progress observation if it moves the job forward
    async fn advance(&self, job: &mut AcquisitionJob, update: DownloadUpdate) {
        let same_phase = job.status == update.status;
        if same_phase && job.progress_percent == update.percent {
            return;
        }
        if !same_phase && !job.status.can_advance_to(update.status) {
            debug!(job_id = job.id, from = %job.status, to = %update.status, "Ignoring backwards transition");
            return;
        }

        job.status = update.status;
        job.progress_percent = update.percent;
        self.persist(job).await;
        self.inner
            .events
            .publish(MediaEvent::download_progress(job.id, update.percent, update.status));
    }

    async fn persist(&self, job: &AcquisitionJob) {
        if let Err(e) = self.inner.jobs.update_job(job).await {
            warn!(job_id = job.id, error = %e, "Failed to persist acquisition job");
        }
    }
}

impl std::fmt::Debug for AcquisitionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("AcquisitionQueue")
            .field("active", &state.active)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// Stored message and pushed message for a failed job
fn failure_messages(error: &SyncError) -> (String, String) {
    match error {
        SyncError::Download(message) => (message.clone(), DOWNLOAD_FAILED_MESSAGE.to_string()),
        other => (other.to_string(), other.to_string()),
    }
}
