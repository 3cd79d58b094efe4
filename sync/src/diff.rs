//! Three-way diff between the library tree and a device tree

use std::collections::BTreeMap;
use std::path::Path;

use media_sync_core::{DiffEntry, SkipEntry, SyncDiff};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::scanner::AudioScanner;

/// Classifies library and device files into copy / skip / orphan buckets.
///
/// Equality is relative path plus size. A file moved to another folder in
/// the library shows up as a new copy and a stale orphan; there is no rename
/// detection.
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    scanner: AudioScanner,
}

impl DiffEngine {
    pub fn new(scanner: AudioScanner) -> Self {
        Self { scanner }
    }

    /// Walk both roots and classify every audio file
    #[instrument(skip_all, fields(library = %library_root.display(), device = %device_root.display()))]
    pub async fn diff(&self, library_root: &Path, device_root: &Path) -> Result<SyncDiff> {
        let library = self.scanner.size_map(library_root).await?;
        let device = self.scanner.size_map(device_root).await?;

        let diff = Self::classify(&library, &device);
        debug!(
            to_copy = diff.to_copy.len(),
            to_skip = diff.to_skip.len(),
            orphans = diff.orphans.len(),
            "Diff computed"
        );
        Ok(diff)
    }

    /// Pure classification over two `relative path -> size` snapshots.
    ///
    /// Output vectors are ordered by relative path, so identical inputs
    /// always produce identical diffs.
    pub fn classify(library: &BTreeMap<String, u64>, device: &BTreeMap<String, u64>) -> SyncDiff {
        let mut diff = SyncDiff::default();

        for (relative_path, &size) in library {
            match device.get(relative_path) {
                Some(&device_size) if device_size == size => diff.to_skip.push(SkipEntry {
                    relative_path: relative_path.clone(),
                }),
                _ => diff.to_copy.push(DiffEntry {
                    relative_path: relative_path.clone(),
                    size_bytes: size,
                }),
            }
        }

        for (relative_path, &size) in device {
            if !library.contains_key(relative_path) {
                diff.orphans.push(DiffEntry {
                    relative_path: relative_path.clone(),
                    size_bytes: size,
                });
            }
        }

        diff
    }
}
