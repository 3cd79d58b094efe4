//! Media sync engine
//!
//! Everything the bedside appliance does with media files:
//! - Removable device detection, mounting and eject
//! - Library/device diffing by relative path and size
//! - Single-instance sync jobs with progress and cancellation
//! - Serialized media acquisition through an external downloader
//! - SQLite catalog of ingested files
//! - Direct mp3 uploads into the library
//! - A broadcast event bus for push observers

pub mod acquisition;
pub mod catalog;
pub mod device;
pub mod diff;
pub mod error;
pub mod events;
pub mod filter;
pub mod library;
pub mod progress;
pub mod scanner;
pub mod service;
pub mod store;
pub mod sync_job;
pub mod upload;

// Re-export main types
pub use acquisition::{AcquisitionQueue, DownloadExecutor, DownloaderOptions, ThumbnailCache, YtDlpExecutor};
pub use catalog::{CatalogStore, JobStore};
pub use device::{platform_probe, DeviceMonitor, DeviceProbe, DeviceTransition, ProbeOptions};
pub use diff::DiffEngine;
pub use error::{Result, SyncError};
pub use events::{EventBus, EventSubscription};
pub use filter::{AudioFilter, AudioFilterOptions};
pub use library::scan_library;
pub use scanner::AudioScanner;
pub use service::{MediaSyncService, ServiceOptions, ServiceParts};
pub use store::{SqliteStore, StoreConfig};
pub use sync_job::{SyncJobRunner, SyncJobSlot, SyncOutcome};
pub use upload::UploadForm;

#[cfg(test)]
mod integration_tests;
