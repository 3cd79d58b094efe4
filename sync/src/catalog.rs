//! Persistence interfaces for the media catalog and acquisition jobs

use std::path::Path;

use async_trait::async_trait;
use media_sync_core::{
    AcquisitionJob, ArtistCount, CatalogEntry, CatalogFilter, CatalogPatch, Category, CategoryCount,
    NewCatalogEntry,
};

use crate::error::Result;

/// Persistent table of ingested media items
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Entries matching `filter`, ordered by artist then title
    async fn list(&self, filter: &CatalogFilter) -> Result<Vec<CatalogEntry>>;

    async fn get(&self, id: i64) -> Result<Option<CatalogEntry>>;

    /// Insert an entry.
    ///
    /// # Errors
    /// - `InvalidInput` if the file path is outside the library root
    /// - `Conflict` if another entry already owns the file path
    async fn insert(&self, entry: &NewCatalogEntry) -> Result<CatalogEntry>;

    /// Apply a partial update; unknown ids are `NotFound`
    async fn update(&self, id: i64, patch: &CatalogPatch) -> Result<CatalogEntry>;

    /// Remove the row, then try to remove the file it points at
    async fn delete(&self, id: i64) -> Result<()>;

    async fn exists_by_path(&self, path: &Path) -> Result<bool>;

    /// Entry count for every category, including empty ones
    async fn category_counts(&self) -> Result<Vec<CategoryCount>>;

    async fn artist_counts(&self, category: Option<Category>) -> Result<Vec<ArtistCount>>;
}

/// Persistence for acquisition jobs so their state survives a restart
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job in `pending`
    async fn insert_job(&self, source_url: &str) -> Result<AcquisitionJob>;

    /// Persist status, progress, error and result entry of `job`
    async fn update_job(&self, job: &AcquisitionJob) -> Result<()>;

    async fn get_job(&self, id: i64) -> Result<Option<AcquisitionJob>>;

    /// Newest first
    async fn recent_jobs(&self, limit: u32) -> Result<Vec<AcquisitionJob>>;

    /// Move every non-terminal job to `error`, returning how many changed.
    /// Used at startup: nothing is running yet, so such jobs were interrupted.
    async fn fail_unfinished(&self, message: &str) -> Result<u64>;
}
