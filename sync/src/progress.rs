//! Transfer metering for sync jobs

use std::time::{Duration, Instant};

use media_sync_core::{SyncProgress, SyncSummary};

/// Tracks copied files and bytes for one sync job and derives the
/// progress and summary payloads published on the event bus.
#[derive(Debug, Clone)]
pub struct TransferMeter {
    start_time: Instant,
    total: usize,
    copied: usize,
    deleted: usize,
    bytes_copied: u64,
}

impl TransferMeter {
    pub fn new(total: usize) -> Self {
        Self::started_at(Instant::now(), total)
    }

    pub fn started_at(start_time: Instant, total: usize) -> Self {
        Self {
            start_time,
            total,
            copied: 0,
            deleted: 0,
            bytes_copied: 0,
        }
    }

    pub fn record_deletion(&mut self) {
        self.deleted += 1;
    }

    /// Record a finished copy and return the progress snapshot for it
    pub fn record_copy(&mut self, relative_path: &str, bytes: u64) -> SyncProgress {
        self.record_copy_at(Instant::now(), relative_path, bytes)
    }

    pub fn record_copy_at(&mut self, now: Instant, relative_path: &str, bytes: u64) -> SyncProgress {
        self.copied += 1;
        self.bytes_copied += bytes;

        SyncProgress {
            copied: self.copied,
            total: self.total,
            current_file: relative_path.to_string(),
            bytes_per_second: bytes_per_second(self.bytes_copied, now.duration_since(self.start_time)),
        }
    }

    pub fn copied(&self) -> usize {
        self.copied
    }

    pub fn deleted(&self) -> usize {
        self.deleted
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn summary(&self, skipped: usize) -> SyncSummary {
        self.summary_at(Instant::now(), skipped)
    }

    pub fn summary_at(&self, now: Instant, skipped: usize) -> SyncSummary {
        SyncSummary {
            copied: self.copied,
            skipped,
            deleted: self.deleted,
            duration_seconds: now.duration_since(self.start_time).as_secs_f64().round() as u64,
        }
    }
}

/// Rounded transfer rate; zero when no time has elapsed
pub fn bytes_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs).round() as u64
    } else {
        0
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
