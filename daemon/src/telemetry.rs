//! Telemetry module for logging and metrics
//!
//! This module provides:
//! - Structured logging with pretty or JSON console output
//! - Rolling JSON log files through `tracing-appender`
//! - Prometheus metrics fed from the engine's event bus

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use media_sync::events::{EventBus, EventSubscription};
use media_sync_core::MediaEvent;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Write JSON instead of pretty text to the console
    #[serde(default)]
    pub json_logging: bool,
    #[serde(default = "default_true")]
    pub console_logging: bool,
    /// Local log file path; JSON lines, rotated per `log_rotation`
    #[serde(default)]
    pub log_file_path: Option<PathBuf>,
    #[serde(default)]
    pub log_rotation: LogRotation,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics at `/metrics`
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often the uptime and observer gauges are refreshed
    #[serde(with = "humantime_serde", default = "default_refresh_interval")]
    pub refresh_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
            console_logging: true,
            log_file_path: None,
            log_rotation: LogRotation::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<()> {
        let level = self.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', expected one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            );
        }
        if self.metrics.refresh_interval.is_zero() {
            anyhow::bail!("Metrics refresh interval must be greater than zero");
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_refresh_interval() -> Duration { Duration::from_secs(15) }

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes the
/// file writer and must be held for the life of the process.
pub fn init_logging(config: &TelemetryConfig) -> Result<Option<WorkerGuard>> {
    let level = config.log_level.to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "media_sync={level},media_sync_daemon={level},tower_http=warn"
        ))
    });

    let console_layer = match (config.console_logging, config.json_logging) {
        (false, _) => None,
        (true, true) => Some(fmt::layer().json().with_current_span(true).boxed()),
        (true, false) => Some(
            fmt::layer()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .pretty()
                .boxed(),
        ),
    };

    let (file_layer, guard) = match &config.log_file_path {
        Some(log_path) => {
            let directory = log_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;
            let file_name = log_path
                .file_name()
                .unwrap_or_else(|| OsStr::new("media-sync.log"));

            let appender = match config.log_rotation {
                LogRotation::Daily => rolling::daily(directory, file_name),
                LogRotation::Hourly => rolling::hourly(directory, file_name),
                LogRotation::Never => rolling::never(directory, file_name),
            };
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .json()
                .with_current_span(true)
                .with_span_list(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    info!(level = %level, file = ?config.log_file_path, "Logging initialized");
    Ok(guard)
}

/// Prometheus collectors for the daemon
#[derive(Clone)]
pub struct MediaSyncMetrics {
    registry: Registry,
    started: Instant,

    pub device_connected: IntGauge,
    pub sync_jobs_total: IntCounterVec,
    pub sync_files_copied_total: IntCounter,
    pub sync_orphans_deleted_total: IntCounter,
    pub acquisition_jobs_total: IntCounterVec,
    pub event_observers: IntGauge,
    pub daemon_uptime_seconds: IntGauge,
}

impl MediaSyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let device_connected = IntGauge::new(
            "media_sync_device_connected",
            "1 while a removable device is connected",
        )?;

        let sync_jobs_total = IntCounterVec::new(
            Opts::new("media_sync_sync_jobs_total", "Finished sync jobs by outcome"),
            &["outcome"],
        )?;

        let sync_files_copied_total = IntCounter::new(
            "media_sync_files_copied_total",
            "Files copied to devices",
        )?;

        let sync_orphans_deleted_total = IntCounter::new(
            "media_sync_orphans_deleted_total",
            "Orphaned device files deleted",
        )?;

        let acquisition_jobs_total = IntCounterVec::new(
            Opts::new("media_sync_acquisition_jobs_total", "Finished acquisition jobs by outcome"),
            &["outcome"],
        )?;

        let event_observers = IntGauge::new(
            "media_sync_event_observers",
            "Currently connected push observers",
        )?;

        let daemon_uptime_seconds = IntGauge::new(
            "media_sync_daemon_uptime_seconds",
            "Daemon uptime in seconds",
        )?;

        registry.register(Box::new(device_connected.clone()))?;
        registry.register(Box::new(sync_jobs_total.clone()))?;
        registry.register(Box::new(sync_files_copied_total.clone()))?;
        registry.register(Box::new(sync_orphans_deleted_total.clone()))?;
        registry.register(Box::new(acquisition_jobs_total.clone()))?;
        registry.register(Box::new(event_observers.clone()))?;
        registry.register(Box::new(daemon_uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            started: Instant::now(),
            device_connected,
            sync_jobs_total,
            sync_files_copied_total,
            sync_orphans_deleted_total,
            acquisition_jobs_total,
            event_observers,
            daemon_uptime_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Fold one bus event into the counters
    pub fn record(&self, event: &MediaEvent) {
        match event {
            MediaEvent::UsbConnected(_) => self.device_connected.set(1),
            MediaEvent::UsbDisconnected(_) => self.device_connected.set(0),
            MediaEvent::SyncProgress(_) => self.sync_files_copied_total.inc(),
            MediaEvent::SyncComplete(summary) => {
                self.sync_jobs_total.with_label_values(&["complete"]).inc();
                self.sync_orphans_deleted_total.inc_by(summary.deleted as u64);
            }
            MediaEvent::SyncError(_) => self.sync_jobs_total.with_label_values(&["error"]).inc(),
            MediaEvent::DownloadProgress(_) => {}
            MediaEvent::DownloadComplete(_) => {
                self.acquisition_jobs_total.with_label_values(&["complete"]).inc()
            }
            MediaEvent::DownloadError(_) => {
                self.acquisition_jobs_total.with_label_values(&["error"]).inc()
            }
        }
    }

    /// Refresh the gauges that are sampled rather than event driven
    pub fn refresh(&self, events: &EventBus) {
        self.daemon_uptime_seconds
            .set(self.started.elapsed().as_secs() as i64);
        self.event_observers.set(events.observer_count() as i64);
    }

    /// Text exposition of every registered collector
    pub fn render(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Consume bus events and sample gauges until `cancel` fires
    pub fn spawn_recorder(
        &self,
        events: EventBus,
        mut subscription: EventSubscription,
        refresh_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let metrics = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Metrics recorder stopping");
                        break;
                    }
                    _ = interval.tick() => metrics.refresh(&events),
                    event = subscription.next() => match event {
                        Some(event) => metrics.record(&event),
                        None => break,
                    },
                }
            }
        })
    }
}

pub async fn metrics_handler(State(metrics): State<MediaSyncMetrics>) -> Response {
    match metrics.render() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_sync_core::{RemovableDevice, SyncSummary};

    #[test]
    fn test_events_drive_counters() {
        let metrics = MediaSyncMetrics::new().unwrap();

        metrics.record(&MediaEvent::UsbConnected(RemovableDevice {
            mount_path: PathBuf::from("/media/alarm-clock"),
            label: "CLOCK".to_string(),
            total_bytes: 10,
            free_bytes: 5,
        }));
        assert_eq!(metrics.device_connected.get(), 1);

        metrics.record(&MediaEvent::SyncComplete(SyncSummary {
            copied: 3,
            skipped: 1,
            deleted: 2,
            duration_seconds: 4,
        }));
        metrics.record(&MediaEvent::sync_failed("disk full"));
        metrics.record(&MediaEvent::download_failed(1, "Download failed"));
        metrics.record(&MediaEvent::device_removed("/media/alarm-clock"));

        assert_eq!(metrics.device_connected.get(), 0);
        assert_eq!(metrics.sync_jobs_total.with_label_values(&["complete"]).get(), 1);
        assert_eq!(metrics.sync_jobs_total.with_label_values(&["error"]).get(), 1);
        assert_eq!(metrics.sync_orphans_deleted_total.get(), 2);
        assert_eq!(metrics.acquisition_jobs_total.with_label_values(&["error"]).get(), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("media_sync_sync_jobs_total{outcome=\"complete\"} 1"));
    }

    #[test]
    fn test_config_validation() {
        assert!(TelemetryConfig::default().validate().is_ok());

        let config = TelemetryConfig {
            log_level: "loud".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let parsed: TelemetryConfig = toml::from_str(
            r#"
            log_level = "DEBUG"
            log_file_path = "/var/log/media-sync/daemon.log"
            log_rotation = "hourly"
            "#,
        )
        .unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.log_rotation, LogRotation::Hourly);
        assert!(parsed.metrics.enabled);
    }

    #[tokio::test]
    async fn test_recorder_follows_bus() {
        let metrics = MediaSyncMetrics::new().unwrap();
        let bus = EventBus::default();
        let cancel = CancellationToken::new();
        let handle = metrics.spawn_recorder(bus.clone(), bus.subscribe(), Duration::from_secs(60), cancel.clone());

        bus.publish(MediaEvent::download_failed(2, "Download failed"));
        for _ in 0..50 {
            if metrics.acquisition_jobs_total.with_label_values(&["error"]).get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(metrics.acquisition_jobs_total.with_label_values(&["error"]).get(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
