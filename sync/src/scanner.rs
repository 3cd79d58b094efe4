//! Audio tree scanning using walkdir

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::filter::AudioFilter;

/// An audio file found under a scan root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFile {
    /// Absolute path to the file
    pub path: PathBuf,
    /// Path relative to the scan root, `/`-separated
    pub relative_path: String,
    /// File size in bytes
    pub size: u64,
}

/// Recursive audio scanner.
///
/// Unreadable directories and a missing root are reported as empty rather
/// than as errors: removable players often carry system folders the
/// current user cannot list.
#[derive(Debug, Clone, Default)]
pub struct AudioScanner {
    filter: AudioFilter,
}

impl AudioScanner {
    pub fn new(filter: AudioFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &AudioFilter {
        &self.filter
    }

    /// Scan a tree on the blocking pool
    pub async fn scan(&self, root: impl AsRef<Path>) -> Result<Vec<AudioFile>> {
        let scanner = self.clone();
        let root = root.as_ref().to_path_buf();
        let files = tokio::task::spawn_blocking(move || scanner.scan_blocking(&root)).await?;
        Ok(files)
    }

    /// Scan a tree into a `relative path -> size` map
    pub async fn size_map(&self, root: impl AsRef<Path>) -> Result<BTreeMap<String, u64>> {
        let files = self.scan(root).await?;
        Ok(files
            .into_iter()
            .map(|file| (file.relative_path, file.size))
            .collect())
    }

    /// Walk `root` synchronously, returning files sorted by relative path
    pub fn scan_blocking(&self, root: &Path) -> Vec<AudioFile> {
        if !root.is_dir() {
            debug!(root = %root.display(), "Scan root missing, treating as empty");
            return Vec::new();
        }

        let filter = &self.filter;
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                entry
                    .path()
                    .strip_prefix(root)
                    .map(|rel| filter.should_descend(rel))
                    .unwrap_or(false)
            });

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = match entry.path().strip_prefix(root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };

            if !filter.is_audio_file(relative) {
                continue;
            }

            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping file without metadata");
                    continue;
                }
            };

            // A lossy name would point the copy at a file that does not exist
            let Some(relative_path) = relative_path_string(relative) else {
                warn!(path = %entry.path().display(), "Skipping file whose name is not valid UTF-8");
                continue;
            };

            files.push(AudioFile {
                path: entry.path().to_path_buf(),
                relative_path,
                size,
            });
        }

        files
    }
}

/// Render a relative path with `/` separators, or `None` if any component
/// is not valid UTF-8
pub fn relative_path_string(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_str()?);
        }
    }
    Some(parts.join("/"))
}

/// Resolve a `/`-separated relative path under `root`.
///
/// Returns `None` for absolute paths, empty paths and anything containing
/// `..`, so callers can never touch files outside the root.
pub fn resolve_under(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0;

    for part in relative.split(['/', '\\']) {
        match part {
            "" if depth == 0 && relative.starts_with(['/', '\\']) => return None,
            "" | "." => continue,
            ".." => return None,
            part if Path::new(part).is_absolute() || part.contains(':') => return None,
            part => {
                resolved.push(part);
                depth += 1;
            }
        }
    }

    (depth > 0).then_some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; len]).unwrap();
    }

    #[tokio::test]
    async fn test_scan_collects_audio_only() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "music/Coldplay/yellow.mp3", 100);
        write(temp.path(), "music/Coldplay/cover.jpg", 10);
        write(temp.path(), "lullabies/Brahms/lullaby.MP3", 50);
        write(temp.path(), ".thumbnails/skip.mp3", 5);

        let scanner = AudioScanner::default();
        let map = scanner.size_map(temp.path()).await.unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("music/Coldplay/yellow.mp3"), Some(&100));
        assert_eq!(map.get("lullabies/Brahms/lullaby.MP3"), Some(&50));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let temp = TempDir::new().unwrap();
        let files = AudioScanner::default()
            .scan(temp.path().join("nope"))
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_subtree_is_empty() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        write(temp.path(), "music/ok/a.mp3", 1);
        write(temp.path(), "locked/b.mp3", 1);
        let locked = temp.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        let files = AudioScanner::default().scan(temp.path()).await.unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let names: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert!(names.contains(&"music/ok/a.mp3"));
        // root ignores permission bits, so only assert the readable file made it
        assert!(names.len() <= 2);
    }

    #[test]
    fn test_resolve_under() {
        let root = Path::new("/media/player");

        assert_eq!(
            resolve_under(root, "music/a/b.mp3"),
            Some(PathBuf::from("/media/player/music/a/b.mp3"))
        );
        assert_eq!(resolve_under(root, "../etc/passwd"), None);
        assert_eq!(resolve_under(root, "music/../../x.mp3"), None);
        assert_eq!(resolve_under(root, "/etc/passwd"), None);
        assert_eq!(resolve_under(root, ""), None);
    }

    #[test]
    fn test_relative_path_string() {
        let rel = Path::new("music").join("Coldplay").join("song.mp3");
        assert_eq!(relative_path_string(&rel).as_deref(), Some("music/Coldplay/song.mp3"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        write(temp.path(), "music/x/good.mp3", 4);
        let odd = temp.path().join("music/x").join(OsStr::from_bytes(b"bad\xff.mp3"));
        fs::write(&odd, b"abc").unwrap();

        let files = AudioScanner::default().scan(temp.path()).await.unwrap();

        let names: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["music/x/good.mp3"]);
        assert_eq!(relative_path_string(odd.strip_prefix(temp.path()).unwrap()), None);
    }
}
