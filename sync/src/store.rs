//! SQLite-backed catalog and job store

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use media_sync_core::{
    AcquisitionJob, AcquisitionStatus, ArtistCount, CatalogEntry, CatalogFilter, CatalogPatch, Category,
    CategoryCount, NewCatalogEntry,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info, warn};

use crate::catalog::{CatalogStore, JobStore};
use crate::error::{Result, SyncError};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS media_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        category TEXT NOT NULL CHECK(category IN ('lullabies', 'music', 'audiobooks')),
        duration_seconds INTEGER NOT NULL DEFAULT 0,
        file_path TEXT NOT NULL UNIQUE,
        thumbnail_url TEXT,
        source_url TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS import_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_url TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK(status IN ('pending', 'downloading', 'converting', 'complete', 'error')),
        progress_percent INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        media_item_id INTEGER REFERENCES media_items(id) ON DELETE SET NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_media_items_category_artist ON media_items(category, artist)",
    "CREATE INDEX IF NOT EXISTS idx_import_jobs_status ON import_jobs(status)",
];

const MEDIA_COLUMNS: &str =
    "id, title, artist, category, duration_seconds, file_path, thumbnail_url, source_url, created_at";
const JOB_COLUMNS: &str = "id, source_url, status, progress_percent, error_message, media_item_id, created_at";

/// Connection settings for [`SqliteStore`]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl StoreConfig {
    /// Database file at `path`, created if missing
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            database_url: format!("sqlite:{}", path.as_ref().display()),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since every connection to `:memory:` sees its own database.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: None,
            max_lifetime: None,
        }
    }
}

/// Catalog and job persistence over one SQLite pool.
///
/// Every catalog file path must live under `library_root`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    library_root: PathBuf,
}

impl SqliteStore {
    pub async fn connect(config: StoreConfig, library_root: impl Into<PathBuf>) -> Result<Self> {
        info!(
            database_url = %config.database_url,
            max_connections = config.max_connections,
            "Opening catalog database"
        );

        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to open catalog database");
                SyncError::Database(e)
            })?;

        let store = Self {
            pool,
            library_root: library_root.into(),
        };
        store.create_schema().await?;
        Ok(store)
    }

    pub async fn in_memory(library_root: impl Into<PathBuf>) -> Result<Self> {
        Self::connect(StoreConfig::in_memory(), library_root).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    async fn create_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Catalog schema ready");
        Ok(())
    }

    fn check_library_path(&self, path: &Path) -> Result<()> {
        let escapes = path.components().any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.library_root) || path == self.library_root {
            return Err(SyncError::invalid_input(
                "filePath",
                format!(
                    "'{}' is not inside the library root '{}'",
                    path.display(),
                    self.library_root.display()
                ),
            ));
        }
        Ok(())
    }

    async fn require_entry(&self, id: i64) -> Result<CatalogEntry> {
        self.get(id)
            .await?
            .ok_or_else(|| SyncError::not_found("media item", id))
    }
}

#[derive(Debug, FromRow)]
struct MediaRow {
    id: i64,
    title: String,
    artist: String,
    category: String,
    duration_seconds: i64,
    file_path: String,
    thumbnail_url: Option<String>,
    source_url: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MediaRow> for CatalogEntry {
    type Error = SyncError;

    fn try_from(row: MediaRow) -> Result<Self> {
        let category = Category::from_str(&row.category).map_err(decode_error)?;
        Ok(CatalogEntry {
            id: row.id,
            title: row.title,
            artist: row.artist,
            category,
            duration_seconds: u32::try_from(row.duration_seconds).unwrap_or(0),
            file_path: PathBuf::from(row.file_path),
            thumbnail_ref: row.thumbnail_url,
            source_url: row.source_url,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    source_url: String,
    status: String,
    progress_percent: i64,
    error_message: Option<String>,
    media_item_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AcquisitionJob {
    type Error = SyncError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = AcquisitionStatus::from_str(&row.status).map_err(decode_error)?;
        Ok(AcquisitionJob {
            id: row.id,
            source_url: row.source_url,
            status,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            error_message: row.error_message,
            result_entry_id: row.media_item_id,
            created_at: row.created_at,
        })
    }
}

fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> SyncError {
    SyncError::Database(sqlx::Error::Decode(Box::new(e)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl CatalogStore for SqliteStore {
    async fn list(&self, filter: &CatalogFilter) -> Result<Vec<CatalogEntry>> {
        let sql = format!(
            "SELECT {} FROM media_items \
             WHERE (?1 IS NULL OR category = ?1) AND (?2 IS NULL OR artist = ?2) \
             ORDER BY artist COLLATE NOCASE, title COLLATE NOCASE",
            MEDIA_COLUMNS
        );
        let rows = sqlx::query_as::<_, MediaRow>(&sql)
            .bind(filter.category.map(|c| c.as_str()))
            .bind(filter.artist.as_deref())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    async fn get(&self, id: i64) -> Result<Option<CatalogEntry>> {
        let sql = format!("SELECT {} FROM media_items WHERE id = ?", MEDIA_COLUMNS);
        let row = sqlx::query_as::<_, MediaRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CatalogEntry::try_from).transpose()
    }

    async fn insert(&self, entry: &NewCatalogEntry) -> Result<CatalogEntry> {
        self.check_library_path(&entry.file_path)?;
        if entry.title.trim().is_empty() {
            return Err(SyncError::invalid_input("title", "must not be empty"));
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO media_items (
                title, artist, category, duration_seconds, file_path,
                thumbnail_url, source_url, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.title)
        .bind(&entry.artist)
        .bind(entry.category.as_str())
        .bind(i64::from(entry.duration_seconds))
        .bind(path_text(&entry.file_path))
        .bind(&entry.thumbnail_ref)
        .bind(&entry.source_url)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SyncError::Conflict(format!("'{}' is already in the catalog", entry.file_path.display()))
            } else {
                SyncError::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        debug!(id, path = %entry.file_path.display(), "Catalog entry inserted");
        self.require_entry(id).await
    }

    async fn update(&self, id: i64, patch: &CatalogPatch) -> Result<CatalogEntry> {
        let mut entry = self.require_entry(id).await?;
        if patch.is_empty() {
            return Ok(entry);
        }

        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(SyncError::invalid_input("title", "must not be empty"));
            }
            entry.title = title.clone();
        }
        if let Some(artist) = &patch.artist {
            entry.artist = artist.clone();
        }
        if let Some(category) = patch.category {
            entry.category = category;
        }
        if let Some(duration) = patch.duration_seconds {
            entry.duration_seconds = duration;
        }
        if let Some(thumbnail) = &patch.thumbnail_ref {
            entry.thumbnail_ref = Some(thumbnail.clone());
        }

        sqlx::query(
            r#"
            UPDATE media_items
            SET title = ?, artist = ?, category = ?, duration_seconds = ?, thumbnail_url = ?
            WHERE id = ?
            "#,
        )
        .bind(&entry.title)
        .bind(&entry.artist)
        .bind(entry.category.as_str())
        .bind(i64::from(entry.duration_seconds))
        .bind(&entry.thumbnail_ref)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let entry = self.require_entry(id).await?;

        sqlx::query("DELETE FROM media_items WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => debug!(id, path = %entry.file_path.display(), "Deleted media file"),
            Err(e) => warn!(
                id,
                error = %SyncError::deletion_error(&entry.file_path, e.to_string()),
                "Catalog entry removed but its file could not be deleted"
            ),
        }
        Ok(())
    }

    async fn exists_by_path(&self, path: &Path) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM media_items WHERE file_path = ?")
            .bind(path_text(path))
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn category_counts(&self) -> Result<Vec<CategoryCount>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT category, COUNT(*) FROM media_items GROUP BY category")
                .fetch_all(&self.pool)
                .await?;

        Ok(Category::ALL
            .iter()
            .map(|category| CategoryCount {
                category: *category,
                count: rows
                    .iter()
                    .find(|(name, _)| name == category.as_str())
                    .map(|(_, count)| *count as u64)
                    .unwrap_or(0),
            })
            .collect())
    }

    async fn artist_counts(&self, category: Option<Category>) -> Result<Vec<ArtistCount>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT artist, COUNT(*) FROM media_items \
             WHERE (?1 IS NULL OR category = ?1) \
             GROUP BY artist ORDER BY artist COLLATE NOCASE",
        )
        .bind(category.map(|c| c.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(artist, count)| ArtistCount {
                artist,
                count: count as u64,
            })
            .collect())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, source_url: &str) -> Result<AcquisitionJob> {
        let created_at = Utc::now();
        let result = sqlx::query("INSERT INTO import_jobs (source_url, status, created_at) VALUES (?, 'pending', ?)")
            .bind(source_url)
            .bind(created_at)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        self.get_job(id)
            .await?
            .ok_or_else(|| SyncError::not_found("import job", id))
    }

    async fn update_job(&self, job: &AcquisitionJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE import_jobs
            SET status = ?, progress_percent = ?, error_message = ?, media_item_id = ?
            WHERE id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.progress_percent))
        .bind(&job.error_message)
        .bind(job.result_entry_id)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::not_found("import job", job.id));
        }
        Ok(())
    }

    async fn get_job(&self, id: i64) -> Result<Option<AcquisitionJob>> {
        let sql = format!("SELECT {} FROM import_jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AcquisitionJob::try_from).transpose()
    }

    async fn recent_jobs(&self, limit: u32) -> Result<Vec<AcquisitionJob>> {
        let sql = format!("SELECT {} FROM import_jobs ORDER BY id DESC LIMIT ?", JOB_COLUMNS);
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AcquisitionJob::try_from).collect()
    }

    async fn fail_unfinished(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE import_jobs SET status = 'error', error_message = ? \
             WHERE status IN ('pending', 'downloading', 'converting')",
        )
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
