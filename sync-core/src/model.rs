//! Data model shared by the engine, the daemon and its clients.
//!
//! Everything here is plain serde data. JSON field names are camelCase to
//! match what the kiosk UI consumes over the control surface.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A removable volume detected by a device probe.
///
/// The mount path is the identity. Capacity fields are refreshed on every
/// poll while the same mount path stays present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovableDevice {
    pub mount_path: PathBuf,
    pub label: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl RemovableDevice {
    /// Bytes currently in use on the volume
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// Library category. Also the first directory level of the library tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Lullabies,
    Music,
    Audiobooks,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Lullabies, Category::Music, Category::Audiobooks];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Lullabies => "lullabies",
            Category::Music => "music",
            Category::Audiobooks => "audiobooks",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category '{0}' (expected lullabies, music or audiobooks)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lullabies" => Ok(Category::Lullabies),
            "music" => Ok(Category::Music),
            "audiobooks" => Ok(Category::Audiobooks),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// A persisted catalog row describing one ingested media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub category: Category,
    pub duration_seconds: u32,
    /// Absolute path inside the library root; unique across the catalog
    pub file_path: PathBuf,
    pub thumbnail_ref: Option<String>,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to insert a catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCatalogEntry {
    pub title: String,
    pub artist: String,
    pub category: Category,
    #[serde(default)]
    pub duration_seconds: u32,
    pub file_path: PathBuf,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

/// Partial update for a catalog entry. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
}

impl CatalogPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.category.is_none()
            && self.duration_seconds.is_none()
            && self.thumbnail_ref.is_none()
    }
}

/// Catalog listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: Category,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCount {
    pub artist: String,
    pub count: u64,
}

/// A file found under the library or device root.
///
/// `relative_path` always uses `/` separators so library and device trees
/// compare equal regardless of host platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffEntry {
    pub relative_path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipEntry {
    pub relative_path: String,
}

/// Three-way classification of library and device files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDiff {
    pub to_copy: Vec<DiffEntry>,
    pub to_skip: Vec<SkipEntry>,
    pub orphans: Vec<DiffEntry>,
}

impl SyncDiff {
    /// Total bytes a sync would write to the device
    pub fn bytes_to_copy(&self) -> u64 {
        self.to_copy.iter().map(|entry| entry.size_bytes).sum()
    }

    /// Total bytes held by orphaned device files
    pub fn orphan_bytes(&self) -> u64 {
        self.orphans.iter().map(|entry| entry.size_bytes).sum()
    }

    /// True when the device already mirrors the library and holds nothing extra
    pub fn is_in_sync(&self) -> bool {
        self.to_copy.is_empty() && self.orphans.is_empty()
    }
}

/// Body of a sync start request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub delete_orphans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Syncing,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub copied: usize,
    pub total: usize,
    pub current_file: String,
    pub bytes_per_second: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub copied: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub duration_seconds: u64,
}

/// Snapshot of the current (or most recent) sync job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: Uuid,
    pub status: SyncStatus,
    pub progress: Option<SyncProgress>,
    pub summary: Option<SyncSummary>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SyncJob {
    pub fn started() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SyncStatus::Syncing,
            progress: None,
            summary: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::Syncing
    }
}

/// Lifecycle of an acquisition job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionStatus {
    Pending,
    Downloading,
    Converting,
    Complete,
    Error,
}

impl AcquisitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionStatus::Pending => "pending",
            AcquisitionStatus::Downloading => "downloading",
            AcquisitionStatus::Converting => "converting",
            AcquisitionStatus::Complete => "complete",
            AcquisitionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionStatus::Complete | AcquisitionStatus::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            AcquisitionStatus::Pending => 0,
            AcquisitionStatus::Downloading => 1,
            AcquisitionStatus::Converting => 2,
            AcquisitionStatus::Complete | AcquisitionStatus::Error => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic
    pub fn can_advance_to(&self, next: AcquisitionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown acquisition status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for AcquisitionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AcquisitionStatus::Pending),
            "downloading" => Ok(AcquisitionStatus::Downloading),
            "converting" => Ok(AcquisitionStatus::Converting),
            "complete" => Ok(AcquisitionStatus::Complete),
            "error" => Ok(AcquisitionStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted long-running ingestion job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionJob {
    pub id: i64,
    pub source_url: String,
    pub status: AcquisitionStatus,
    pub progress_percent: u8,
    pub error_message: Option<String>,
    pub result_entry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Submission for the acquisition queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionRequest {
    pub url: String,
    pub title: String,
    pub artist: String,
    pub category: Category,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
}

/// Metadata fetched from a source URL before import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub title: String,
    pub artist: String,
    pub duration_seconds: u32,
    pub thumbnail_url: Option<String>,
    pub video_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing() {
        assert_eq!("music".parse::<Category>(), Ok(Category::Music));
        assert_eq!(" Lullabies ".parse::<Category>(), Ok(Category::Lullabies));
        assert!("podcasts".parse::<Category>().is_err());
        assert_eq!(Category::Audiobooks.to_string(), "audiobooks");
    }

    #[test]
    fn test_acquisition_status_is_monotonic() {
        use AcquisitionStatus::*;

        assert!(Pending.can_advance_to(Downloading));
        assert!(Pending.can_advance_to(Error));
        assert!(Downloading.can_advance_to(Converting));
        assert!(Converting.can_advance_to(Complete));
        assert!(!Converting.can_advance_to(Downloading));
        assert!(!Downloading.can_advance_to(Downloading));
        assert!(!Complete.can_advance_to(Error));
        assert!(!Error.can_advance_to(Complete));
    }

    #[test]
    fn test_json_uses_camel_case() {
        let device = RemovableDevice {
            mount_path: PathBuf::from("/media/alarm-clock"),
            label: "SANDISK".to_string(),
            total_bytes: 8_000,
            free_bytes: 6_000,
        };
        let value = serde_json::to_value(&device).unwrap();
        assert_eq!(value["mountPath"], "/media/alarm-clock");
        assert_eq!(value["freeBytes"], 6_000);
        assert_eq!(device.used_bytes(), 2_000);

        let diff = SyncDiff {
            to_copy: vec![DiffEntry { relative_path: "music/a.mp3".into(), size_bytes: 10 }],
            to_skip: vec![],
            orphans: vec![],
        };
        let value = serde_json::to_value(&diff).unwrap();
        assert_eq!(value["toCopy"][0]["relativePath"], "music/a.mp3");
        assert_eq!(value["toCopy"][0]["sizeBytes"], 10);
    }

    #[test]
    fn test_sync_request_defaults_to_no_deletions() {
        let request: SyncRequest = serde_json::from_str("{}").unwrap();
        assert!(request.delete_orphans.is_empty());
    }
}
