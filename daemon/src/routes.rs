//! HTTP and WebSocket control surface

use axum::{
    body::Bytes,
    extract::{
        multipart::Field,
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, FromRef, Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use media_sync::upload::discard_staged;
use media_sync::{MediaSyncService, SyncError, UploadForm};
use media_sync_core::{
    AcquisitionJob, AcquisitionRequest, ArtistCount, CatalogEntry, CatalogFilter, CatalogPatch, Category,
    CategoryCount, MediaMetadata, RemovableDevice, SyncDiff, SyncJob, SyncRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path as FsPath, PathBuf};
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, warn};

use crate::telemetry::{metrics_handler, MediaSyncMetrics};

/// Largest accepted upload request
pub const UPLOAD_BODY_LIMIT: usize = 256 * 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub service: MediaSyncService,
    pub metrics: MediaSyncMetrics,
}

impl FromRef<AppState> for MediaSyncMetrics {
    fn from_ref(state: &AppState) -> Self {
        state.metrics.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub cors_allow_any: bool,
    pub metrics_enabled: bool,
    pub thumbnail_dir: PathBuf,
}

pub fn router(state: AppState, options: RouterOptions) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/sync/device", get(current_device))
        .route("/sync/diff", get(diff))
        .route("/sync/start", post(start_sync))
        .route("/sync/status", get(sync_status))
        .route("/sync/eject", post(eject))
        .route("/import", post(submit_import))
        .route("/import/prefetch", post(prefetch))
        .route("/import/jobs", get(recent_jobs))
        .route("/import/jobs/:id", get(job))
        .route("/media", get(list_media))
        .route("/media/categories", get(categories))
        .route("/media/artists", get(artists))
        .route(
            "/media/upload",
            post(upload_media).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route(
            "/media/:id",
            get(media_entry).patch(update_media).delete(delete_media),
        );

    let mut app = Router::new()
        .nest("/api", api)
        .route("/ws", get(push_channel))
        .nest_service("/thumbnails", ServeDir::new(options.thumbnail_dir));

    if options.metrics_enabled {
        app = app.route("/metrics", get(metrics_handler));
    }

    let app = app.with_state(state).layer(TraceLayer::new_for_http());
    if options.cors_allow_any {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// `SyncError` rendered as `{"error": message}` with a matching status
pub struct ApiError {
    error: SyncError,
    status: Option<StatusCode>,
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self { error, status: None }
    }
}

impl ApiError {
    /// A well-formed request the downloader could not satisfy
    fn unprocessable(error: SyncError) -> Self {
        let status = match error {
            SyncError::InvalidInput { .. } => None,
            _ => Some(StatusCode::UNPROCESSABLE_ENTITY),
        };
        Self { error, status }
    }

    pub fn status(&self) -> StatusCode {
        if let Some(status) = self.status {
            return status;
        }
        match &self.error {
            SyncError::NoDevice | SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
            SyncError::Conflict(_) => StatusCode::CONFLICT,
            SyncError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.error, "Request failed");
        } else {
            debug!(error = %self.error, %status, "Request rejected");
        }
        (status, Json(json!({ "error": self.error.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn current_device(State(state): State<AppState>) -> Json<Option<RemovableDevice>> {
    Json(state.service.current_device().await)
}

async fn diff(State(state): State<AppState>) -> ApiResult<Json<SyncDiff>> {
    Ok(Json(state.service.diff().await?))
}

/// Body is optional; an empty body deletes no orphans
async fn start_sync(State(state): State<AppState>, body: Bytes) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| SyncError::invalid_input("body", e.to_string()))?
    };

    let job_id = state.service.start_sync(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "syncing", "jobId": job_id })),
    ))
}

async fn sync_status(State(state): State<AppState>) -> Json<Option<SyncJob>> {
    Json(state.service.sync_status().await)
}

async fn eject(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let device = state.service.eject().await?;
    Ok(Json(json!({ "ejected": true, "mountPath": device.mount_path })))
}

#[derive(Debug, Deserialize)]
struct PrefetchBody {
    url: String,
}

async fn prefetch(State(state): State<AppState>, Json(body): Json<PrefetchBody>) -> ApiResult<Json<MediaMetadata>> {
    state
        .service
        .prefetch(&body.url)
        .await
        .map(Json)
        .map_err(ApiError::unprocessable)
}

async fn submit_import(
    State(state): State<AppState>,
    Json(request): Json<AcquisitionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let job = state.service.submit_import(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job.id }))))
}

async fn recent_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<AcquisitionJob>>> {
    Ok(Json(state.service.recent_jobs().await?))
}

async fn job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<AcquisitionJob>> {
    Ok(Json(state.service.job(id).await?))
}

async fn list_media(
    State(state): State<AppState>,
    Query(filter): Query<CatalogFilter>,
) -> ApiResult<Json<Vec<CatalogEntry>>> {
    Ok(Json(state.service.media(&filter).await?))
}

async fn media_entry(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<CatalogEntry>> {
    Ok(Json(state.service.media_entry(id).await?))
}

async fn update_media(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<CatalogPatch>,
) -> ApiResult<Json<CatalogEntry>> {
    Ok(Json(state.service.update_media(id, &patch).await?))
}

async fn delete_media(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.service.delete_media(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Multipart form: an mp3 `file` part plus `title`, `artist`, `category`
/// and optional `durationSeconds` text parts
async fn upload_media(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<CatalogEntry>)> {
    let staged = state.service.upload_staging_path();
    let form = match read_upload(&mut multipart, &staged).await {
        Ok(form) => form,
        Err(e) => {
            discard_staged(&staged).await;
            return Err(e.into());
        }
    };

    let entry = state.service.ingest_upload(&staged, &form).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

fn malformed(error: impl std::fmt::Display) -> SyncError {
    SyncError::invalid_input("body", error.to_string())
}

async fn read_upload(multipart: &mut Multipart, staged: &FsPath) -> Result<UploadForm, SyncError> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                form.file_name = Some(field.file_name().unwrap_or_default().to_string());
                form.content_type = field.content_type().map(str::to_string);
                stream_to(field, staged).await?;
            }
            "title" => form.title = Some(field.text().await.map_err(malformed)?),
            "artist" => form.artist = Some(field.text().await.map_err(malformed)?),
            "category" => form.category = Some(field.text().await.map_err(malformed)?),
            "durationSeconds" => form.duration_seconds = Some(field.text().await.map_err(malformed)?),
            other => debug!(field = other, "Ignoring upload field"),
        }
    }
    Ok(form)
}

async fn stream_to(mut field: Field<'_>, staged: &FsPath) -> Result<(), SyncError> {
    if let Some(parent) = staged.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(staged).await?;
    while let Some(chunk) = field.chunk().await.map_err(malformed)? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn categories(State(state): State<AppState>) -> ApiResult<Json<Vec<CategoryCount>>> {
    Ok(Json(state.service.categories().await?))
}

#[derive(Debug, Deserialize)]
struct ArtistQuery {
    category: Option<Category>,
}

async fn artists(
    State(state): State<AppState>,
    Query(query): Query<ArtistQuery>,
) -> ApiResult<Json<Vec<ArtistCount>>> {
    Ok(Json(state.service.artists(query.category).await?))
}

async fn push_channel(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| forward_events(state.service, socket))
}

/// Relay bus events to one websocket until either side goes away
async fn forward_events(service: MediaSyncService, mut socket: WebSocket) {
    let mut subscription = service.subscribe();
    debug!(observers = service.events().observer_count(), "Push observer connected");

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Could not encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!("Push observer send failed, dropping it");
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Push observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{body::Body, http::Request};
    use media_sync::acquisition::DownloadUpdate;
    use media_sync::{DownloadExecutor, DeviceProbe, ServiceOptions, ServiceParts, SqliteStore};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, Mutex};
    use tower::ServiceExt;

    struct FixedProbe {
        device: Mutex<Option<RemovableDevice>>,
    }

    #[async_trait]
    impl DeviceProbe for FixedProbe {
        async fn probe(&self) -> media_sync::Result<Option<RemovableDevice>> {
            Ok(self.device.lock().await.clone())
        }

        async fn eject(&self, _device: &RemovableDevice) -> media_sync::Result<()> {
            *self.device.lock().await = None;
            Ok(())
        }
    }

    struct OfflineDownloader;

    #[async_trait]
    impl DownloadExecutor for OfflineDownloader {
        async fn run(
            &self,
            _job_id: i64,
            _url: &str,
            _updates: mpsc::Sender<DownloadUpdate>,
        ) -> media_sync::Result<PathBuf> {
            Err(SyncError::Download("offline".to_string()))
        }

        async fn probe_metadata(&self, _url: &str) -> media_sync::Result<MediaMetadata> {
            Err(SyncError::Download("offline".to_string()))
        }
    }

    struct TestApp {
        router: Router,
        service: MediaSyncService,
        library: TempDir,
        device: TempDir,
    }

    async fn app(with_device: bool) -> TestApp {
        let library = TempDir::new().unwrap();
        let device = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::in_memory(library.path()).await.unwrap());
        let probe = Arc::new(FixedProbe {
            device: Mutex::new(with_device.then(|| RemovableDevice {
                mount_path: device.path().to_path_buf(),
                label: "CLOCK".to_string(),
                total_bytes: 1_000,
                free_bytes: 500,
            })),
        });

        let service = MediaSyncService::new(
            ServiceOptions::new(library.path()),
            ServiceParts {
                probe,
                catalog: store.clone(),
                jobs: store,
                executor: Arc::new(OfflineDownloader),
            },
        );
        service.monitor().tick().await;

        let state = AppState {
            service: service.clone(),
            metrics: MediaSyncMetrics::new().unwrap(),
        };
        let router = router(
            state,
            RouterOptions {
                cors_allow_any: true,
                metrics_enabled: true,
                thumbnail_dir: library.path().join(".thumbnails"),
            },
        );

        TestApp {
            router,
            service,
            library,
            device,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = router.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_empty_state() {
        let app = app(false).await;

        assert_eq!(send(&app.router, "GET", "/api/health", None).await, (StatusCode::OK, json!({"status": "ok"})));
        assert_eq!(send(&app.router, "GET", "/api/sync/device", None).await, (StatusCode::OK, Value::Null));
        assert_eq!(send(&app.router, "GET", "/api/sync/status", None).await, (StatusCode::OK, Value::Null));
        assert_eq!(send(&app.router, "GET", "/api/media", None).await, (StatusCode::OK, json!([])));

        let (status, categories) = send(&app.router, "GET", "/api/media/categories", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(categories.as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn test_no_device_is_not_found() {
        let app = app(false).await;

        let (status, body) = send(&app.router, "GET", "/api/sync/diff", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "No removable device connected"}));

        assert_eq!(send(&app.router, "POST", "/api/sync/start", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(send(&app.router, "POST", "/api/sync/eject", None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let app = app(true).await;

        let (status, body) = send(&app.router, "POST", "/api/sync/start", Some(json!({"deleteOrphans": []}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "syncing");

        // The first job has not been polled yet on this single-threaded runtime
        let (status, body) = send(&app.router, "POST", "/api/sync/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body, json!({"error": "Conflict: sync already in progress"}));
    }

    #[tokio::test]
    async fn test_diff_and_eject() {
        let app = app(true).await;
        let orphan = app.device.path().join("music/Old/song.mp3");
        std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        std::fs::write(&orphan, b"abc").unwrap();

        let (status, diff) = send(&app.router, "GET", "/api/sync/diff", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(diff["orphans"][0], json!({"relativePath": "music/Old/song.mp3", "sizeBytes": 3}));

        let (status, body) = send(&app.router, "POST", "/api/sync/eject", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ejected"], true);
        assert_eq!(app.service.current_device().await, None);
    }

    #[tokio::test]
    async fn test_import_validation_and_lookup() {
        let app = app(false).await;

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/import",
            Some(json!({"url": "ftp://example.com/x", "title": "X", "artist": "Y", "category": "music"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid url"));

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/import",
            Some(json!({"url": "https://example.com/x", "title": "X", "artist": "Y", "category": "music"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["jobId"].as_i64().unwrap();

        let (status, job) = send(&app.router, "GET", &format!("/api/import/jobs/{}", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["sourceUrl"], "https://example.com/x");

        assert_eq!(send(&app.router, "GET", "/api/import/jobs/999", None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(send(&app.router, "GET", "/api/media/999", None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_exposed() {
        let app = app(false).await;
        let (status, body) = send(&app.router, "GET", "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_str().unwrap().contains("media_sync_daemon_uptime_seconds"));
    }

    const BOUNDARY: &str = "media-sync-test-boundary";

    /// `(name, file name and content type, content)` per part
    fn multipart(parts: &[(&str, Option<(&str, &str)>, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, file, content) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match file {
                Some((file_name, content_type)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        name, file_name, content_type
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                ),
            }
            body.extend_from_slice(content.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    async fn upload(router: &Router, body: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/media/upload")
            .header("content-type", format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn staged_files(library: &TempDir) -> usize {
        std::fs::read_dir(library.path().join(media_sync::upload::UPLOAD_STAGING_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_upload_adds_mp3_to_library() {
        let app = app(false).await;
        let body = multipart(&[
            ("title", None, "Yellow"),
            ("artist", None, "Coldplay"),
            ("category", None, "music"),
            ("durationSeconds", None, "269"),
            ("file", Some(("yellow.mp3", "audio/mpeg")), "ID3 fake mp3"),
        ]);

        let (status, entry) = upload(&app.router, body).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(entry["title"], "Yellow");
        assert_eq!(entry["durationSeconds"], 269);
        let placed = app.library.path().join("music/Coldplay/yellow.mp3");
        assert_eq!(entry["filePath"], json!(placed));
        assert_eq!(std::fs::read(&placed).unwrap(), b"ID3 fake mp3");
        assert_eq!(staged_files(&app.library), 0);

        let (status, listed) = send(&app.router, "GET", "/api/media?category=music", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_upload_rejects_bad_forms_and_cleans_up() {
        let app = app(false).await;

        let not_mp3 = multipart(&[
            ("title", None, "Notes"),
            ("artist", None, "Me"),
            ("category", None, "music"),
            ("file", Some(("notes.txt", "text/plain")), "hello"),
        ]);
        let (status, body) = upload(&app.router, not_mp3).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("mp3"));

        let missing_title = multipart(&[
            ("artist", None, "Coldplay"),
            ("category", None, "music"),
            ("file", Some(("yellow.mp3", "audio/mpeg")), "ID3"),
        ]);
        assert_eq!(upload(&app.router, missing_title).await.0, StatusCode::BAD_REQUEST);

        let no_file = multipart(&[("title", None, "Yellow"), ("artist", None, "Coldplay"), ("category", None, "music")]);
        assert_eq!(upload(&app.router, no_file).await.0, StatusCode::BAD_REQUEST);

        assert_eq!(staged_files(&app.library), 0);
        assert!(!app.library.path().join("music").exists());
        assert_eq!(send(&app.router, "GET", "/api/media", None).await.1, json!([]));
    }

    #[tokio::test]
    async fn test_delete_media_answers_no_content() {
        let app = app(false).await;
        let body = multipart(&[
            ("title", None, "Yellow"),
            ("artist", None, "Coldplay"),
            ("category", None, "music"),
            ("file", Some(("yellow.mp3", "audio/mpeg")), "ID3"),
        ]);
        let (_, entry) = upload(&app.router, body).await;
        let uri = format!("/api/media/{}", entry["id"]);

        assert_eq!(send(&app.router, "DELETE", &uri, None).await, (StatusCode::NO_CONTENT, Value::Null));
        assert_eq!(send(&app.router, "GET", &uri, None).await.0, StatusCode::NOT_FOUND);
        assert_eq!(send(&app.router, "DELETE", &uri, None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prefetch_failure_is_unprocessable() {
        let app = app(false).await;

        let (status, body) = send(
            &app.router,
            "POST",
            "/api/import/prefetch",
            Some(json!({"url": "https://example.com/watch?v=abc"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("offline"));

        let (status, _) = send(&app.router, "POST", "/api/import/prefetch", Some(json!({"url": "not a url"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
