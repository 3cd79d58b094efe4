//! End-to-end scenarios through `MediaSyncService` with a fake device and downloader

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_sync_core::{
    AcquisitionRequest, AcquisitionStatus, CatalogFilter, Category, DiffEntry, MediaEvent, MediaMetadata,
    RemovableDevice, SyncRequest, SyncStatus, SyncSummary,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};

use crate::acquisition::{DownloadExecutor, DownloadUpdate};
use crate::device::{DeviceProbe, DeviceTransition};
use crate::error::{Result, SyncError};
use crate::events::EventSubscription;
use crate::service::{MediaSyncService, ServiceOptions, ServiceParts};
use crate::store::SqliteStore;

/// A single device that stays plugged in until ejected
struct PluggedDevice {
    device: Mutex<Option<RemovableDevice>>,
    fail_eject: bool,
}

#[async_trait]
impl DeviceProbe for PluggedDevice {
    async fn probe(&self) -> Result<Option<RemovableDevice>> {
        Ok(self.device.lock().await.clone())
    }

    async fn eject(&self, _device: &RemovableDevice) -> Result<()> {
        if self.fail_eject {
            return Err(SyncError::Device("umount: target is busy".to_string()));
        }
        *self.device.lock().await = None;
        Ok(())
    }
}

/// Downloader that writes a small file and reports a short transcript
struct InstantDownloader {
    temp_dir: PathBuf,
}

#[async_trait]
impl DownloadExecutor for InstantDownloader {
    async fn run(&self, job_id: i64, _url: &str, updates: mpsc::Sender<DownloadUpdate>) -> Result<PathBuf> {
        for update in [
            DownloadUpdate::downloading(40),
            DownloadUpdate::downloading(100),
            DownloadUpdate::converting(),
        ] {
            let _ = updates.send(update).await;
        }
        let output = self.temp_dir.join(format!("media-sync-{}.mp3", job_id));
        tokio::fs::write(&output, vec![0u8; 64]).await?;
        Ok(output)
    }

    async fn probe_metadata(&self, _url: &str) -> Result<MediaMetadata> {
        Err(SyncError::Download("offline".to_string()))
    }
}

struct Appliance {
    service: MediaSyncService,
    library: TempDir,
    device: TempDir,
    _downloads: TempDir,
}

fn write(root: &Path, rel: &str, len: usize) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![7u8; len]).unwrap();
}

async fn appliance(fail_eject: bool) -> Appliance {
    let library = TempDir::new().unwrap();
    let device = TempDir::new().unwrap();
    let downloads = TempDir::new().unwrap();

    let store = Arc::new(SqliteStore::in_memory(library.path()).await.unwrap());
    let probe = Arc::new(PluggedDevice {
        device: Mutex::new(Some(RemovableDevice {
            mount_path: device.path().to_path_buf(),
            label: "ALARMCLOCK".to_string(),
            total_bytes: 8_000_000,
            free_bytes: 6_000_000,
        })),
        fail_eject,
    });
    let executor = Arc::new(InstantDownloader {
        temp_dir: downloads.path().to_path_buf(),
    });

    let service = MediaSyncService::new(
        ServiceOptions::new(library.path()),
        ServiceParts {
            probe,
            catalog: store.clone(),
            jobs: store,
            executor,
        },
    );

    Appliance {
        service,
        library,
        device,
        _downloads: downloads,
    }
}

async fn next_matching(observer: &mut EventSubscription, matches: impl Fn(&MediaEvent) -> bool) -> MediaEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match observer.next().await {
                Some(event) if matches(&event) => return event,
                Some(_) => {}
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[test_log::test(tokio::test)]
async fn test_connect_diff_sync_eject() {
    let app = appliance(false).await;
    write(app.library.path(), "music/Coldplay/song.mp3", 100);
    let mut observer = app.service.subscribe();

    // Nothing is known until the monitor polls
    assert!(matches!(app.service.diff().await, Err(SyncError::NoDevice)));

    let transition = app.service.monitor().tick().await;
    assert!(matches!(transition, DeviceTransition::Connected(_)));
    assert!(matches!(observer.try_next(), Some(MediaEvent::UsbConnected(_))));

    let diff = app.service.diff().await.unwrap();
    assert_eq!(
        diff.to_copy,
        vec![DiffEntry {
            relative_path: "music/Coldplay/song.mp3".to_string(),
            size_bytes: 100
        }]
    );
    assert!(diff.to_skip.is_empty());
    assert!(diff.orphans.is_empty());

    app.service.start_sync(SyncRequest::default()).await.unwrap();
    let done = next_matching(&mut observer, |e| matches!(e, MediaEvent::SyncComplete(_))).await;
    match done {
        MediaEvent::SyncComplete(SyncSummary {
            copied,
            skipped,
            deleted,
            ..
        }) => assert_eq!((copied, skipped, deleted), (1, 0, 0)),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(
        std::fs::metadata(app.device.path().join("music/Coldplay/song.mp3")).unwrap().len(),
        100
    );

    let status = app.service.sync_status().await.unwrap();
    assert_eq!(status.status, SyncStatus::Complete);

    // Second pass has nothing to do
    let diff = app.service.diff().await.unwrap();
    assert!(diff.is_in_sync());
    assert_eq!(diff.to_skip.len(), 1);

    let ejected = app.service.eject().await.unwrap();
    assert_eq!(ejected.mount_path, app.device.path());
    assert_eq!(app.service.current_device().await, None);
    assert_eq!(
        next_matching(&mut observer, |e| matches!(e, MediaEvent::UsbDisconnected(_))).await,
        MediaEvent::device_removed(app.device.path())
    );
    assert!(matches!(app.service.eject().await, Err(SyncError::NoDevice)));
}

#[tokio::test]
async fn test_sync_deletes_selected_orphans_only() {
    let app = appliance(false).await;
    write(app.library.path(), "lullabies/Mum/hush.mp3", 10);
    write(app.device.path(), "music/Old/gone.mp3", 5);
    write(app.device.path(), "music/Old/keep.mp3", 5);
    app.service.monitor().tick().await;

    let diff = app.service.diff().await.unwrap();
    assert_eq!(diff.orphans.len(), 2);

    let mut observer = app.service.subscribe();
    app.service
        .start_sync(SyncRequest {
            delete_orphans: vec!["music/Old/gone.mp3".to_string(), "../escape.mp3".to_string()],
        })
        .await
        .unwrap();

    let done = next_matching(&mut observer, |e| matches!(e, MediaEvent::SyncComplete(_))).await;
    assert!(matches!(done, MediaEvent::SyncComplete(ref s) if s.copied == 1 && s.deleted == 1));
    assert!(!app.device.path().join("music/Old/gone.mp3").exists());
    assert!(app.device.path().join("music/Old/keep.mp3").exists());
}

#[tokio::test]
async fn test_failed_eject_keeps_device() {
    let app = appliance(true).await;
    app.service.monitor().tick().await;

    assert!(matches!(app.service.eject().await, Err(SyncError::Device(_))));
    assert!(app.service.current_device().await.is_some());
}

#[tokio::test]
async fn test_import_lands_in_catalog() {
    let app = appliance(false).await;
    let mut observer = app.service.subscribe();

    let job = app
        .service
        .submit_import(AcquisitionRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            title: "Twinkle Twinkle".to_string(),
            artist: "Nursery".to_string(),
            category: Category::Lullabies,
            duration_seconds: None,
        })
        .await
        .unwrap();
    assert_eq!(job.status, AcquisitionStatus::Pending);

    let done = next_matching(&mut observer, |e| matches!(e, MediaEvent::DownloadComplete(_))).await;
    let MediaEvent::DownloadComplete(complete) = done else {
        panic!("unexpected event");
    };
    assert_eq!(complete.job_id, job.id);
    assert_eq!(
        complete.entry.file_path,
        app.library.path().join("lullabies/Nursery/twinkle-twinkle.mp3")
    );
    assert_eq!(complete.entry.thumbnail_ref, None);

    let stored = app.service.job(job.id).await.unwrap();
    assert_eq!(stored.status, AcquisitionStatus::Complete);
    assert_eq!(stored.result_entry_id, Some(complete.entry.id));
    assert_eq!(app.service.recent_jobs().await.unwrap().len(), 1);

    let lullabies = app
        .service
        .media(&CatalogFilter {
            category: Some(Category::Lullabies),
            artist: None,
        })
        .await
        .unwrap();
    assert_eq!(lullabies.len(), 1);

    let counts = app.service.categories().await.unwrap();
    assert_eq!(counts.iter().map(|c| c.count).sum::<u64>(), 1);

    // Imported file shows up in the next diff once a device is present
    app.service.monitor().tick().await;
    let diff = app.service.diff().await.unwrap();
    assert_eq!(diff.to_copy[0].relative_path, "lullabies/Nursery/twinkle-twinkle.mp3");

    assert!(matches!(app.service.job(999).await, Err(SyncError::NotFound { .. })));
    assert!(app.service.prefetch("https://example.com/x").await.is_err());
}

#[tokio::test]
async fn test_unplug_right_after_start_touches_nothing() {
    let app = appliance(false).await;
    write(app.library.path(), "music/Coldplay/song.mp3", 100);
    write(app.device.path(), "music/Old/orphan.mp3", 10);
    app.service.monitor().tick().await;

    app.service
        .start_sync(SyncRequest {
            delete_orphans: vec!["music/Old/orphan.mp3".to_string()],
        })
        .await
        .unwrap();
    // Single-threaded runtime: the sync task has not been polled yet
    app.service.monitor().apply(None).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(app.device.path().join("music/Old/orphan.mp3").exists());
    assert!(!app.device.path().join("music/Coldplay/song.mp3").exists());
    assert_eq!(app.service.sync_status().await, None);
    assert!(matches!(
        app.service.start_sync(SyncRequest::default()).await,
        Err(SyncError::NoDevice)
    ));
}
