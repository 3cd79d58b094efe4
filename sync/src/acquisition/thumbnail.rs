//! Thumbnail cache under `{library}/.thumbnails`

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SyncError};

/// Directory name inside the library root; hidden so scans skip it
pub const THUMBNAIL_DIR: &str = ".thumbnails";

fn video_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:v=|youtu\.be/)([A-Za-z0-9_-]{11})").ok())
        .as_ref()
}

/// Eleven-character video id embedded in a watch or short link
pub fn video_id(url: &str) -> Option<String> {
    let captures = video_id_pattern()?.captures(url)?;
    Some(captures.get(1)?.as_str().to_string())
}

#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    dir: PathBuf,
    http: reqwest::Client,
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self::with_client(dir, http)
    }

    pub fn with_client(dir: impl Into<PathBuf>, http: reqwest::Client) -> Self {
        Self { dir: dir.into(), http }
    }

    /// Cache rooted at the conventional directory inside the library
    pub fn in_library(library_root: &Path) -> Self {
        Self::new(library_root.join(THUMBNAIL_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, video_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", video_id))
    }

    /// Public reference for a cached thumbnail, if the file exists
    pub async fn reference(&self, video_id: &str) -> Option<String> {
        match fs::try_exists(self.path_for(video_id)).await {
            Ok(true) => Some(format!("/thumbnails/{}.jpg", video_id)),
            _ => None,
        }
    }

    /// Download `url` into the cache unless it is already there.
    /// Returns true when the thumbnail is cached afterwards.
    pub async fn fetch(&self, video_id: &str, url: &str) -> Result<bool> {
        let destination = self.path_for(video_id);
        if fs::try_exists(&destination).await.unwrap_or(false) {
            debug!(video_id, "Thumbnail already cached");
            return Ok(true);
        }

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Download(format!("thumbnail request failed: {}", e)))?;
        if !response.status().is_success() {
            debug!(video_id, status = %response.status(), "Thumbnail fetch refused");
            return Ok(false);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::Download(format!("thumbnail body failed: {}", e)))?;

        fs::create_dir_all(&self.dir).await?;
        fs::write(&destination, &bytes).await?;
        debug!(video_id, bytes = bytes.len(), "Thumbnail cached");
        Ok(true)
    }
}
