//! Coordinating service.
//!
//! `MediaSyncService` owns one of each engine component and exposes the
//! operations the control surface needs: device state, diffing, sync jobs,
//! eject, acquisition and catalog management.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use media_sync_core::{
    AcquisitionJob, AcquisitionRequest, ArtistCount, CatalogEntry, CatalogFilter, CatalogPatch, Category,
    CategoryCount, MediaEvent, MediaMetadata, RemovableDevice, SyncDiff, SyncJob, SyncRequest,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::acquisition::{AcquisitionQueue, DownloadExecutor};
use crate::catalog::{CatalogStore, JobStore};
use crate::device::{DeviceMonitor, DeviceProbe, DEFAULT_POLL_INTERVAL};
use crate::diff::DiffEngine;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventSubscription, DEFAULT_EVENT_CAPACITY};
use crate::filter::AudioFilter;
use crate::scanner::AudioScanner;
use crate::sync_job::{SyncJobRunner, SyncJobSlot};
use crate::upload::{self, UploadForm};

/// Number of jobs returned by [`MediaSyncService::recent_jobs`]
pub const RECENT_JOB_LIMIT: u32 = 20;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub library_root: PathBuf,
    pub poll_interval: Duration,
    pub event_capacity: usize,
    pub filter: AudioFilter,
}

impl ServiceOptions {
    pub fn new(library_root: impl Into<PathBuf>) -> Self {
        Self {
            library_root: library_root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            filter: AudioFilter::default(),
        }
    }
}

/// External collaborators the service is assembled from
pub struct ServiceParts {
    pub probe: Arc<dyn DeviceProbe>,
    pub catalog: Arc<dyn CatalogStore>,
    pub jobs: Arc<dyn JobStore>,
    pub executor: Arc<dyn DownloadExecutor>,
}

#[derive(Clone)]
pub struct MediaSyncService {
    library_root: PathBuf,
    events: EventBus,
    monitor: DeviceMonitor,
    sync_slot: SyncJobSlot,
    diff_engine: DiffEngine,
    catalog: Arc<dyn CatalogStore>,
    jobs: Arc<dyn JobStore>,
    acquisition: AcquisitionQueue,
}

impl MediaSyncService {
    pub fn new(options: ServiceOptions, parts: ServiceParts) -> Self {
        let events = EventBus::new(options.event_capacity);
        let sync_slot = SyncJobSlot::new();
        let monitor = DeviceMonitor::new(parts.probe, events.clone(), sync_slot.clone())
            .with_poll_interval(options.poll_interval);
        let acquisition = AcquisitionQueue::new(
            parts.catalog.clone(),
            parts.jobs.clone(),
            parts.executor,
            events.clone(),
            options.library_root.clone(),
        );

        Self {
            library_root: options.library_root,
            events,
            monitor,
            sync_slot,
            diff_engine: DiffEngine::new(AudioScanner::new(options.filter)),
            catalog: parts.catalog,
            jobs: parts.jobs,
            acquisition,
        }
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    pub fn monitor(&self) -> &DeviceMonitor {
        &self.monitor
    }

    pub fn acquisition(&self) -> &AcquisitionQueue {
        &self.acquisition
    }

    /// Start polling for devices until `cancel` fires
    pub fn start_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.monitor.spawn(cancel)
    }

    // Device and sync

    pub async fn current_device(&self) -> Option<RemovableDevice> {
        self.monitor.current().await
    }

    async fn require_device(&self) -> Result<RemovableDevice> {
        self.current_device().await.ok_or(SyncError::NoDevice)
    }

    /// Diff the library against the connected device
    pub async fn diff(&self) -> Result<SyncDiff> {
        let device = self.require_device().await?;
        self.diff_engine.diff(&self.library_root, &device.mount_path).await
    }

    /// Claim the sync slot and run a sync in the background.
    ///
    /// The diff is recomputed against the device as it is now, so whatever
    /// the caller looked at earlier only informs which orphans to delete.
    #[instrument(skip_all, fields(delete_orphans = request.delete_orphans.len()))]
    pub async fn start_sync(&self, request: SyncRequest) -> Result<Uuid> {
        let (job_id, device) = self.monitor.begin_sync().await?;
        info!(%job_id, mount_path = %device.mount_path.display(), "Sync requested");

        let runner = SyncJobRunner::new(
            self.library_root.clone(),
            device.mount_path.clone(),
            self.sync_slot.clone(),
            self.events.clone(),
        );
        let diff_engine = self.diff_engine.clone();
        let slot = self.sync_slot.clone();
        let events = self.events.clone();
        let library_root = self.library_root.clone();

        tokio::spawn(async move {
            match diff_engine.diff(&library_root, &device.mount_path).await {
                Ok(diff) => {
                    runner.run(job_id, &diff, &request.delete_orphans).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(%job_id, error = %message, "Could not compute diff for sync");
                    if slot.fail(job_id, message.clone()).await {
                        events.publish(MediaEvent::sync_failed(message));
                    }
                }
            }
        });

        Ok(job_id)
    }

    pub async fn sync_status(&self) -> Option<SyncJob> {
        self.sync_slot.snapshot().await
    }

    /// Eject the connected device and forget it.
    ///
    /// Any running sync is cancelled and `usb_disconnected` is published.
    #[instrument(skip(self))]
    pub async fn eject(&self) -> Result<RemovableDevice> {
        let device = self.require_device().await?;
        self.monitor.probe().eject(&device).await?;
        info!(mount_path = %device.mount_path.display(), "Device ejected");
        Ok(self.monitor.forget_device().await.unwrap_or(device))
    }

    // Acquisition

    pub async fn submit_import(&self, request: AcquisitionRequest) -> Result<AcquisitionJob> {
        self.acquisition.submit(request).await
    }

    pub async fn prefetch(&self, url: &str) -> Result<MediaMetadata> {
        self.acquisition.prefetch(url).await
    }

    pub async fn recent_jobs(&self) -> Result<Vec<AcquisitionJob>> {
        self.jobs.recent_jobs(RECENT_JOB_LIMIT).await
    }

    pub async fn job(&self, id: i64) -> Result<AcquisitionJob> {
        self.jobs
            .get_job(id)
            .await?
            .ok_or_else(|| SyncError::not_found("job", id))
    }

    // Catalog

    pub async fn media(&self, filter: &CatalogFilter) -> Result<Vec<CatalogEntry>> {
        self.catalog.list(filter).await
    }

    pub async fn media_entry(&self, id: i64) -> Result<CatalogEntry> {
        self.catalog
            .get(id)
            .await?
            .ok_or_else(|| SyncError::not_found("media item", id))
    }

    pub async fn update_media(&self, id: i64, patch: &CatalogPatch) -> Result<CatalogEntry> {
        self.catalog.update(id, patch).await
    }

    pub async fn delete_media(&self, id: i64) -> Result<()> {
        self.catalog.delete(id).await
    }

    /// Where the control surface should stream the next upload
    pub fn upload_staging_path(&self) -> PathBuf {
        upload::staging_path(&self.library_root)
    }

    /// Validate and file an upload already written to `staged`
    pub async fn ingest_upload(&self, staged: &Path, form: &UploadForm) -> Result<CatalogEntry> {
        upload::ingest_upload(self.catalog.as_ref(), &self.library_root, staged, form).await
    }

    pub async fn categories(&self) -> Result<Vec<CategoryCount>> {
        self.catalog.category_counts().await
    }

    pub async fn artists(&self, category: Option<Category>) -> Result<Vec<ArtistCount>> {
        self.catalog.artist_counts(category).await
    }
}

impl std::fmt::Debug for MediaSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSyncService")
            .field("library_root", &self.library_root)
            .field("monitor", &self.monitor)
            .field("acquisition", &self.acquisition)
            .finish_non_exhaustive()
    }
}
