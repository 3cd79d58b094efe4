//! Direct mp3 uploads into the library.
//!
//! The control surface streams the file into a staging directory inside the
//! library root (hidden, so scans and diffs never see it), then hands the
//! form fields here. Rejected uploads are deleted from staging.

use std::io;
use std::path::{Path, PathBuf};

use media_sync_core::{CatalogEntry, Category, NewCatalogEntry};
use tokio::fs;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::error::{Result, SyncError};
use crate::library::place_in_library;

/// Staging directory under the library root
pub const UPLOAD_STAGING_DIR: &str = ".uploads";

const MP3_CONTENT_TYPE: &str = "audio/mpeg";

/// Upload form fields as received, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadForm {
    /// Client-side name of the file part; `None` when no file was sent
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub category: Option<String>,
    pub duration_seconds: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ValidUpload {
    title: String,
    artist: String,
    category: Category,
    duration_seconds: u32,
}

/// Fresh staging path for one upload
pub fn staging_path(library_root: &Path) -> PathBuf {
    library_root
        .join(UPLOAD_STAGING_DIR)
        .join(format!("upload-{}.mp3", Uuid::new_v4()))
}

fn required(value: &Option<String>, field: &'static str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(SyncError::invalid_input(field, "is required")),
    }
}

fn validate(form: &UploadForm) -> Result<ValidUpload> {
    let Some(file_name) = &form.file_name else {
        return Err(SyncError::invalid_input("file", "no file uploaded"));
    };
    let is_mp3 = form.content_type.as_deref() == Some(MP3_CONTENT_TYPE)
        || file_name.to_ascii_lowercase().ends_with(".mp3");
    if !is_mp3 {
        return Err(SyncError::invalid_input("file", "only mp3 uploads are accepted"));
    }

    let title = required(&form.title, "title")?;
    let artist = required(&form.artist, "artist")?;
    let category = required(&form.category, "category")?
        .parse::<Category>()
        .map_err(|e| SyncError::invalid_input("category", e.to_string()))?;
    let duration_seconds = match form.duration_seconds.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse()
            .map_err(|_| SyncError::invalid_input("durationSeconds", format!("'{}' is not a number", raw)))?,
    };

    Ok(ValidUpload {
        title,
        artist,
        category,
        duration_seconds,
    })
}

/// Remove a staged file; a file that never arrived is fine
pub async fn discard_staged(staged: &Path) {
    match fs::remove_file(staged).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staged.display(), error = %e, "Could not remove staged upload"),
    }
}

/// Validate an upload, move it to `{category}/{artist}/{slug}.mp3` and
/// register it in the catalog.
#[instrument(skip_all, fields(staged = %staged.display()))]
pub async fn ingest_upload(
    catalog: &dyn CatalogStore,
    library_root: &Path,
    staged: &Path,
    form: &UploadForm,
) -> Result<CatalogEntry> {
    let upload = match validate(form) {
        Ok(upload) => upload,
        Err(e) => {
            discard_staged(staged).await;
            return Err(e);
        }
    };

    let file_path = match place_in_library(staged, library_root, upload.category, &upload.artist, &upload.title).await
    {
        Ok(path) => path,
        Err(e) => {
            discard_staged(staged).await;
            return Err(e);
        }
    };

    let inserted = catalog
        .insert(&NewCatalogEntry {
            title: upload.title,
            artist: upload.artist,
            category: upload.category,
            duration_seconds: upload.duration_seconds,
            file_path: file_path.clone(),
            thumbnail_ref: None,
            source_url: None,
        })
        .await;

    match inserted {
        Ok(entry) => {
            info!(entry_id = entry.id, path = %file_path.display(), "Upload added to library");
            Ok(entry)
        }
        Err(e) => {
            // The name was freshly reserved, so nothing else refers to this file
            if let Err(cleanup) = fs::remove_file(&file_path).await {
                warn!(path = %file_path.display(), error = %cleanup, "Could not remove unregistered upload");
            }
            Err(e)
        }
    }
}
