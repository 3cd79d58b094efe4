//! Audio file filtering using globset

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Extensions treated as playable audio when none are configured
pub const DEFAULT_AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "flac", "wav"];

/// Audio filter options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFilterOptions {
    /// Extensions without the leading dot, matched case-insensitively
    pub extensions: Vec<String>,
    /// Include hidden files and directories (starting with .)
    pub include_hidden: bool,
}

impl Default for AudioFilterOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_AUDIO_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            include_hidden: false,
        }
    }
}

/// Decides which files under a library or device root take part in a diff.
///
/// Hidden entries are excluded by default: FAT-formatted players collect
/// `._name.mp3` resource forks from macOS hosts and the library keeps its
/// thumbnail cache under `.thumbnails`.
#[derive(Debug, Clone)]
pub struct AudioFilter {
    extension_set: GlobSet,
    options: AudioFilterOptions,
}

impl Default for AudioFilter {
    fn default() -> Self {
        // The default extensions are fixed literals and always compile
        Self::new(AudioFilterOptions::default()).unwrap_or_else(|_| Self {
            extension_set: GlobSet::empty(),
            options: AudioFilterOptions::default(),
        })
    }
}

impl AudioFilter {
    /// Create a new audio filter with the given options
    pub fn new(options: AudioFilterOptions) -> Result<Self> {
        if options.extensions.is_empty() {
            return Err(SyncError::FilterPattern(
                "at least one audio extension is required".to_string(),
            ));
        }

        let extension_set = Self::build_globset(&options.extensions)?;
        Ok(Self {
            extension_set,
            options,
        })
    }

    /// Create a filter matching only the given extensions
    pub fn by_extensions(extensions: &[&str]) -> Result<Self> {
        Self::new(AudioFilterOptions {
            extensions: extensions.iter().map(|ext| ext.to_string()).collect(),
            ..Default::default()
        })
    }

    /// Check whether a file path (relative to a scan root) is a playable audio file
    pub fn is_audio_file(&self, path: &Path) -> bool {
        if !self.options.include_hidden && Self::is_hidden(path) {
            return false;
        }

        match path.file_name() {
            Some(name) => self.extension_set.is_match(Path::new(name)),
            None => false,
        }
    }

    /// Check whether a directory (relative to a scan root) should be descended into
    pub fn should_descend(&self, relative_dir: &Path) -> bool {
        self.options.include_hidden || !Self::is_hidden(relative_dir)
    }

    /// Get the filter options
    pub fn options(&self) -> &AudioFilterOptions {
        &self.options
    }

    fn build_globset(extensions: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for ext in extensions {
            let ext = ext.trim().trim_start_matches('.');
            if ext.is_empty() || ext.contains(['/', '\\', '*']) {
                return Err(SyncError::FilterPattern(format!("invalid audio extension '{}'", ext)));
            }

            let pattern = format!("*.{}", ext);
            let glob = GlobBuilder::new(&pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    SyncError::FilterPattern(format!("Failed to compile glob '{}': {}", pattern, e))
                })?;

            builder.add(glob);
        }

        builder
            .build()
            .map_err(|e| SyncError::FilterPattern(format!("Failed to build globset: {}", e)))
    }

    fn is_hidden(path: &Path) -> bool {
        path.components().any(|component| {
            component
                .as_os_str()
                .to_str()
                .map(|s| s.starts_with('.') && s != "." && s != "..")
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use test_case::test_case;

    #[test_case("music/Coldplay/song.mp3", true ; "plain mp3")]
    #[test_case("music/Coldplay/SONG.MP3", true ; "uppercase extension")]
    #[test_case("audiobooks/Dahl/matilda.m4a", true ; "m4a")]
    #[test_case("music/Coldplay/cover.jpg", false ; "image")]
    #[test_case("music/Coldplay/._song.mp3", false ; "appledouble fork")]
    #[test_case(".thumbnails/abc.mp3", false ; "hidden directory")]
    #[test_case("music/Coldplay/song.mp3.part", false ; "partial download")]
    fn test_default_filter(path: &str, expected: bool) {
        let filter = AudioFilter::default();
        assert_eq!(filter.is_audio_file(&PathBuf::from(path)), expected);
    }

    #[test]
    fn test_custom_extensions() {
        let filter = AudioFilter::by_extensions(&[".MP3"]).unwrap();

        assert!(filter.is_audio_file(Path::new("a/b.mp3")));
        assert!(!filter.is_audio_file(Path::new("a/b.flac")));
    }

    #[test]
    fn test_hidden_files_can_be_included() {
        let filter = AudioFilter::new(AudioFilterOptions {
            include_hidden: true,
            ..Default::default()
        })
        .unwrap();

        assert!(filter.is_audio_file(Path::new(".hidden/track.mp3")));
        assert!(filter.should_descend(Path::new(".hidden")));
    }

    #[test]
    fn test_rejects_bad_extension_lists() {
        assert!(AudioFilter::by_extensions(&[]).is_err());
        assert!(AudioFilter::by_extensions(&["mp*"]).is_err());
        assert!(!AudioFilter::default().should_descend(Path::new(".Trashes")));
    }
}
