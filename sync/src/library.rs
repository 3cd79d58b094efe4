//! Library tree layout: `{category}/{artist}/{slug}.{ext}`

use std::io;
use std::path::{Path, PathBuf};

use media_sync_core::{Category, NewCatalogEntry};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::catalog::CatalogStore;
use crate::error::{Result, SyncError};
use crate::filter::AudioFilter;

/// Lowercase ASCII slug; runs of anything else collapse to one `-`
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;

    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Make `name` safe as a single directory name
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' | ':' => '-',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();

    if cleaned.is_empty() {
        "Unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Destination of an ingested file inside the library
pub fn library_path(library_root: &Path, category: Category, artist: &str, title: &str, extension: &str) -> PathBuf {
    library_root
        .join(category.as_str())
        .join(sanitize_component(artist))
        .join(format!("{}.{}", slugify(title), extension))
}

/// Human title from a file name: stem with `-` and `_` turned into spaces
pub fn title_from_file_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.replace(['-', '_'], " ").trim().to_string()
}

/// Move `source` to `destination`, creating parent directories.
///
/// Rename first; across filesystems fall back to copy then remove. An
/// existing destination is overwritten.
pub async fn move_file(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!(source = %source.display(), "Rename crossed filesystems, copying instead");
            fs::copy(source, destination)
                .await
                .map_err(|e| SyncError::copy_error(source, destination, e.to_string()))?;
            fs::remove_file(source)
                .await
                .map_err(|e| SyncError::deletion_error(source, e.to_string()))?;
            Ok(())
        }
        Err(e) => Err(SyncError::copy_error(source, destination, e.to_string())),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

/// `ERROR_NOT_SAME_DEVICE`
#[cfg(windows)]
const WINDOWS_NOT_SAME_DEVICE: i32 = 17;

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(WINDOWS_NOT_SAME_DEVICE)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Numbered names tried after the plain slug is taken
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Place an ingested file under the library and return its final path.
///
/// Never replaces an existing file: when `{slug}.{ext}` is taken the file
/// becomes `{slug}-2.{ext}`, `{slug}-3.{ext}` and so on.
pub async fn place_in_library(
    source: &Path,
    library_root: &Path,
    category: Category,
    artist: &str,
    title: &str,
) -> Result<PathBuf> {
    let extension = source
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "mp3".to_string());
    let preferred = library_path(library_root, category, artist, title, &extension);
    let destination = reserve_destination(&preferred, &slugify(title), &extension).await?;

    if let Err(e) = move_file(source, &destination).await {
        if let Err(cleanup) = fs::remove_file(&destination).await {
            warn!(path = %destination.display(), error = %cleanup, "Could not remove reserved library name");
        }
        return Err(e);
    }
    debug!(path = %destination.display(), "Placed file in library");
    Ok(destination)
}

/// Claim a free file name next to `preferred` by creating it empty.
///
/// `create_new` makes the claim atomic, so concurrent placements of the same
/// title end up with different names.
async fn reserve_destination(preferred: &Path, slug: &str, extension: &str) -> Result<PathBuf> {
    if let Some(parent) = preferred.parent() {
        fs::create_dir_all(parent).await?;
    }

    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 1 {
            preferred.to_path_buf()
        } else {
            preferred.with_file_name(format!("{}-{}.{}", slug, attempt, extension))
        };

        match fs::OpenOptions::new().write(true).create_new(true).open(&candidate).await {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(SyncError::path_error(preferred, "no free file name for this title"))
}

/// Register audio files already present in the library tree.
///
/// Walks `{category}/{artist}/` for every category and inserts each audio
/// file not yet in the catalog. Returns how many entries were added.
#[instrument(skip_all, fields(library = %library_root.display()))]
pub async fn scan_library(store: &dyn CatalogStore, library_root: &Path, filter: &AudioFilter) -> Result<usize> {
    let mut added = 0;

    for category in Category::ALL {
        let category_dir = library_root.join(category.as_str());
        for artist_dir in subdirectories(&category_dir).await {
            let artist = match artist_dir.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };

            for file in audio_files(&artist_dir, filter).await {
                if store.exists_by_path(&file).await? {
                    continue;
                }

                let entry = NewCatalogEntry {
                    title: title_from_file_name(&file),
                    artist: artist.clone(),
                    category,
                    duration_seconds: 0,
                    file_path: file.clone(),
                    thumbnail_ref: None,
                    source_url: None,
                };
                match store.insert(&entry).await {
                    Ok(_) => added += 1,
                    Err(e) => warn!(path = %file.display(), error = %e, "Could not register library file"),
                }
            }
        }
    }

    info!(added, "Library scan complete");
    Ok(added)
}

async fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return found;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            found.push(entry.path());
        }
    }
    found.sort();
    found
}

async fn audio_files(dir: &Path, filter: &AudioFilter) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return found;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = PathBuf::from(entry.file_name());
        if entry.file_type().await.is_ok_and(|t| t.is_file()) && filter.is_audio_file(&name) {
            found.push(entry.path());
        }
    }
    found.sort();
    found
}
