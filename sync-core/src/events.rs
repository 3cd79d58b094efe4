//! Push channel events.
//!
//! Every event serializes to a flat JSON object carrying its name in the
//! `event` field, e.g. `{"event":"usb_disconnected","mountPath":"/media/x"}`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::{AcquisitionStatus, CatalogEntry, RemovableDevice, SyncProgress, SyncSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MediaEvent {
    UsbConnected(RemovableDevice),
    UsbDisconnected(DeviceRemoved),
    SyncProgress(SyncProgress),
    SyncComplete(SyncSummary),
    SyncError(SyncFailed),
    DownloadProgress(DownloadProgress),
    DownloadComplete(DownloadComplete),
    DownloadError(DownloadFailed),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRemoved {
    pub mount_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailed {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub job_id: i64,
    pub percent: u8,
    pub status: AcquisitionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadComplete {
    pub job_id: i64,
    pub entry: CatalogEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFailed {
    pub job_id: i64,
    pub message: String,
}

impl MediaEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            MediaEvent::UsbConnected(_) => "usb_connected",
            MediaEvent::UsbDisconnected(_) => "usb_disconnected",
            MediaEvent::SyncProgress(_) => "sync_progress",
            MediaEvent::SyncComplete(_) => "sync_complete",
            MediaEvent::SyncError(_) => "sync_error",
            MediaEvent::DownloadProgress(_) => "download_progress",
            MediaEvent::DownloadComplete(_) => "download_complete",
            MediaEvent::DownloadError(_) => "download_error",
        }
    }

    pub fn device_removed(mount_path: impl Into<PathBuf>) -> Self {
        MediaEvent::UsbDisconnected(DeviceRemoved {
            mount_path: mount_path.into(),
        })
    }

    pub fn sync_failed(message: impl Into<String>) -> Self {
        MediaEvent::SyncError(SyncFailed {
            message: message.into(),
        })
    }

    pub fn download_progress(job_id: i64, percent: u8, status: AcquisitionStatus) -> Self {
        MediaEvent::DownloadProgress(DownloadProgress {
            job_id,
            percent,
            status,
        })
    }

    pub fn download_failed(job_id: i64, message: impl Into<String>) -> Self {
        MediaEvent::DownloadError(DownloadFailed {
            job_id,
            message: message.into(),
        })
    }

    /// Encode as a push channel text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_events_are_flat() {
        let event = MediaEvent::UsbConnected(RemovableDevice {
            mount_path: PathBuf::from("/Volumes/PLAYER"),
            label: "PLAYER".to_string(),
            total_bytes: 100,
            free_bytes: 40,
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "usb_connected",
                "mountPath": "/Volumes/PLAYER",
                "label": "PLAYER",
                "totalBytes": 100,
                "freeBytes": 40
            })
        );

        let value = serde_json::to_value(MediaEvent::device_removed("/Volumes/PLAYER")).unwrap();
        assert_eq!(value, json!({"event": "usb_disconnected", "mountPath": "/Volumes/PLAYER"}));
    }

    #[test]
    fn test_download_progress_shape() {
        let event = MediaEvent::download_progress(7, 42, AcquisitionStatus::Downloading);
        let text = event.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value, json!({"event": "download_progress", "jobId": 7, "percent": 42, "status": "downloading"}));
        assert_eq!(event.name(), "download_progress");
    }

    #[test]
    fn test_decodes_what_it_encodes() {
        let event = MediaEvent::SyncComplete(SyncSummary {
            copied: 1,
            skipped: 0,
            deleted: 0,
            duration_seconds: 3,
        });
        let decoded: MediaEvent = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
