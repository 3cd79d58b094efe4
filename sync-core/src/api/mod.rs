//! Daemon API client module
//!
//! Typed access to the media-sync daemon: request/response calls over HTTP
//! and the push channel over a websocket.

pub mod client;
pub mod error;
pub mod realtime;

pub use client::{DaemonClient, DaemonClientBuilder, HealthResponse, MediaUpload, SubmitResponse};
pub use error::{ClientError, Result};
pub use realtime::{RealtimeClient, RealtimeSubscription};
