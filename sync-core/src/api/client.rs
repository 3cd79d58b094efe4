use super::error::*;
use crate::model::*;
use reqwest::multipart::{Form, Part};
use reqwest::{ClientBuilder, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP client for the media-sync daemon control surface
#[derive(Clone)]
pub struct DaemonClient {
    http_client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: i64,
}

/// Catalog fields sent alongside an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub title: String,
    pub artist: String,
    pub category: Category,
    pub duration_seconds: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

impl DaemonClient {
    /// Create a client with reasonable timeouts
    pub fn new(base_url: &str) -> Result<Self> {
        DaemonClientBuilder::new(base_url).build()
    }

    pub fn with_client(base_url: &str, http_client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            http_client,
            base_url: Url::parse(base_url)?,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an API path against the daemon base URL
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn health_check(&self) -> Result<HealthResponse> {
        self.request(Method::GET, "api/health", None::<&()>).await
    }

    pub async fn device(&self) -> Result<Option<RemovableDevice>> {
        self.request(Method::GET, "api/sync/device", None::<&()>).await
    }

    pub async fn diff(&self) -> Result<SyncDiff> {
        self.request(Method::GET, "api/sync/diff", None::<&()>).await
    }

    pub async fn start_sync(&self, request: &SyncRequest) -> Result<()> {
        let _: serde_json::Value = self.request(Method::POST, "api/sync/start", Some(request)).await?;
        Ok(())
    }

    pub async fn sync_status(&self) -> Result<Option<SyncJob>> {
        self.request(Method::GET, "api/sync/status", None::<&()>).await
    }

    pub async fn eject(&self) -> Result<()> {
        let _: serde_json::Value = self.request(Method::POST, "api/sync/eject", None::<&()>).await?;
        Ok(())
    }

    pub async fn prefetch(&self, url: &str) -> Result<MediaMetadata> {
        let body = serde_json::json!({ "url": url });
        self.request(Method::POST, "api/import/prefetch", Some(&body)).await
    }

    pub async fn submit_import(&self, request: &AcquisitionRequest) -> Result<i64> {
        let response: SubmitResponse = self.request(Method::POST, "api/import", Some(request)).await?;
        Ok(response.job_id)
    }

    pub async fn import_jobs(&self) -> Result<Vec<AcquisitionJob>> {
        self.request(Method::GET, "api/import/jobs", None::<&()>).await
    }

    pub async fn import_job(&self, id: i64) -> Result<AcquisitionJob> {
        self.request(Method::GET, &format!("api/import/jobs/{}", id), None::<&()>).await
    }

    pub async fn media(&self, filter: &CatalogFilter) -> Result<Vec<CatalogEntry>> {
        let query = serde_urlencoded::to_string(filter)?;
        let path = if query.is_empty() {
            "api/media".to_string()
        } else {
            format!("api/media?{}", query)
        };
        self.request(Method::GET, &path, None::<&()>).await
    }

    pub async fn update_media(&self, id: i64, patch: &CatalogPatch) -> Result<CatalogEntry> {
        self.request(Method::PATCH, &format!("api/media/{}", id), Some(patch)).await
    }

    /// Answered with 204 and no body
    pub async fn delete_media(&self, id: i64) -> Result<()> {
        let url = self.endpoint(&format!("api/media/{}", id))?;
        debug!(%url, "Daemon request");
        self.send(self.http_client.delete(url)).await?;
        Ok(())
    }

    /// Upload a local mp3 straight into the library
    pub async fn upload_media(&self, file: &Path, upload: &MediaUpload) -> Result<CatalogEntry> {
        let bytes = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.mp3".to_string());

        let mut form = Form::new()
            .text("title", upload.title.clone())
            .text("artist", upload.artist.clone())
            .text("category", upload.category.to_string())
            .part("file", Part::bytes(bytes).file_name(file_name).mime_str("audio/mpeg")?);
        if let Some(duration) = upload.duration_seconds {
            form = form.text("durationSeconds", duration.to_string());
        }

        let url = self.endpoint("api/media/upload")?;
        debug!(%url, file = %file.display(), "Daemon upload");
        let response = self.send(self.http_client.post(url).multipart(form)).await?;
        Ok(response.json().await?)
    }

    async fn request<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<R> {
        let url = self.endpoint(path)?;
        debug!(%method, %url, "Daemon request");

        let mut request = self.http_client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        Ok(self.send(request).await?.json().await?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &text))
    }
}

fn error_for_status(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.to_string());

    match status {
        StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::CONFLICT => ClientError::Conflict(message),
        _ => ClientError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

// Builder pattern for client configuration
pub struct DaemonClientBuilder {
    base_url: String,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl DaemonClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(10)),
            user_agent: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self) -> Result<DaemonClient> {
        let mut client_builder = ClientBuilder::new()
            .user_agent(self.user_agent.unwrap_or_else(|| "media-sync/0.1.0".to_string()));

        if let Some(timeout) = self.timeout {
            client_builder = client_builder.timeout(timeout);
        }

        if let Some(connect_timeout) = self.connect_timeout {
            client_builder = client_builder.connect_timeout(connect_timeout);
        }

        let http_client = client_builder.build()?;

        // Url::join drops the last segment unless the base ends with '/'
        let mut base_url = self.base_url;
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        DaemonClient::with_client(&base_url, http_client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builder() {
        let client = DaemonClientBuilder::new("http://localhost:4000")
            .timeout(Duration::from_secs(60))
            .user_agent("test-client/1.0")
            .build()
            .unwrap();

        assert_eq!(
            client.endpoint("api/sync/diff").unwrap().as_str(),
            "http://localhost:4000/api/sync/diff"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            DaemonClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_error_for_status() {
        let err = error_for_status(StatusCode::CONFLICT, r#"{"error":"sync already in progress"}"#);
        assert!(matches!(err, ClientError::Conflict(ref m) if m == "sync already in progress"));

        let err = error_for_status(StatusCode::NOT_FOUND, "plain text");
        assert!(matches!(err, ClientError::NotFound(ref m) if m == "plain text"));

        let err = error_for_status(StatusCode::BAD_GATEWAY, "");
        assert!(err.is_retryable());

        let err = error_for_status(StatusCode::BAD_REQUEST, r#"{"error":"bad"}"#);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_media_filter_query() {
        let filter = CatalogFilter {
            category: Some(Category::Music),
            artist: Some("The Wiggles".to_string()),
        };
        let query = serde_urlencoded::to_string(&filter).unwrap();
        assert_eq!(query, "category=music&artist=The+Wiggles");
        assert_eq!(serde_urlencoded::to_string(CatalogFilter::default()).unwrap(), "");
    }

    #[tokio::test]
    async fn test_upload_of_missing_file_fails_locally() {
        let client = DaemonClient::new("http://localhost:4000").unwrap();
        let upload = MediaUpload {
            title: "Yellow".to_string(),
            artist: "Coldplay".to_string(),
            category: Category::Music,
            duration_seconds: None,
        };

        let err = client
            .upload_media(Path::new("/nonexistent/yellow.mp3"), &upload)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(!err.is_retryable());
    }
}
