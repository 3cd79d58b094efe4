use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Query encoding error: {0}")]
    Query(#[from] serde_urlencoded::ser::Error),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::WebSocket(_) => true,
            ClientError::Server { status, .. } if *status >= 500 => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
