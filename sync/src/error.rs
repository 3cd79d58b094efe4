//! Error types for the media sync engine

use std::path::PathBuf;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error type shared by every engine component
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Path-related errors
    #[error("Path error at '{path}': {message}")]
    Path { path: PathBuf, message: String },

    /// Filter pattern errors
    #[error("Filter pattern error: {0}")]
    FilterPattern(String),

    /// File copying errors
    #[error("File copy error from '{source_path}' to '{dest_path}': {message}")]
    FileCopy {
        source_path: PathBuf,
        dest_path: PathBuf,
        message: String,
    },

    /// File deletion errors
    #[error("File deletion error at '{path}': {message}")]
    FileDeletion { path: PathBuf, message: String },

    /// Device probe, mount or eject failures
    #[error("Device error: {0}")]
    Device(String),

    /// No removable device is connected
    #[error("No removable device connected")]
    NoDevice,

    /// Work rejected because it would break a single-instance invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Lookup of a catalog entry or job failed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Caller supplied data that fails validation
    #[error("Invalid {field}: {message}")]
    InvalidInput { field: &'static str, message: String },

    /// Catalog or job store failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// External downloader failures
    #[error("Download error: {0}")]
    Download(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Background task failed to join
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    /// Create a new path error
    pub fn path_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new file copy error
    pub fn copy_error(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileCopy {
            source_path: source.into(),
            dest_path: dest.into(),
            message: message.into(),
        }
    }

    /// Create a new file deletion error
    pub fn deletion_error(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::FileDeletion {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Whether the error is the "already running" rejection
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }
}
