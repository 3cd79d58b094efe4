use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use media_sync::acquisition::{DownloaderOptions, THUMBNAIL_DIR};
use media_sync::device::{ProbeOptions, DEFAULT_LINUX_MOUNT_POINT};
use media_sync::events::DEFAULT_EVENT_CAPACITY;
use media_sync::filter::{AudioFilter, AudioFilterOptions, DEFAULT_AUDIO_EXTENSIONS};
use media_sync::service::ServiceOptions;

use crate::telemetry::TelemetryConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaSyncConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Answer CORS preflights from any origin (the kiosk UI is served elsewhere)
    #[serde(default = "default_true")]
    pub cors_allow_any: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_library_root")]
    pub root: PathBuf,
    /// Holds the SQLite catalog
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_audio_extensions")]
    pub audio_extensions: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    /// Register files already in the library tree at startup
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(default = "default_linux_mount_point")]
    pub linux_mount_point: PathBuf,
    #[serde(default = "default_volumes_dir")]
    pub volumes_dir: PathBuf,
    #[serde(default)]
    pub extra_system_volumes: Vec<String>,
    #[serde(default = "default_true")]
    pub use_sudo: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_downloader")]
    pub downloader: String,
    /// Arguments placed before the downloader's own, e.g. `["-m", "yt_dlp"]`
    #[serde(default)]
    pub downloader_args: Vec<String>,
    /// Extra arguments placed just before the URL, e.g. `["--js-runtimes", "node"]`
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    #[serde(default = "default_audio_format")]
    pub audio_format: String,
    #[serde(default = "default_audio_quality")]
    pub audio_quality: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            cors_allow_any: true,
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_library_root(),
            data_dir: default_data_dir(),
            audio_extensions: default_audio_extensions(),
            include_hidden: false,
            scan_on_start: true,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            linux_mount_point: default_linux_mount_point(),
            volumes_dir: default_volumes_dir(),
            extra_system_volumes: Vec::new(),
            use_sudo: true,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            downloader: default_downloader(),
            downloader_args: Vec::new(),
            extra_args: Vec::new(),
            temp_dir: default_temp_dir(),
            audio_format: default_audio_format(),
            audio_quality: default_audio_quality(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl MediaSyncConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: MediaSyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.library.root.as_os_str().is_empty() {
            anyhow::bail!("Library root cannot be empty");
        }
        if self.library.audio_extensions.is_empty() {
            anyhow::bail!("At least one audio extension is required");
        }
        // Reject extension lists the filter cannot compile
        self.audio_filter()?;

        if self.device.poll_interval.is_zero() {
            anyhow::bail!("Device poll interval must be greater than zero");
        }
        if !self.device.linux_mount_point.is_absolute() {
            anyhow::bail!(
                "Linux mount point must be absolute: {}",
                self.device.linux_mount_point.display()
            );
        }

        if self.acquisition.downloader.trim().is_empty() {
            anyhow::bail!("Downloader program cannot be empty");
        }
        if self.acquisition.audio_format.trim().is_empty() {
            anyhow::bail!("Audio format cannot be empty");
        }

        if self.events.capacity == 0 {
            anyhow::bail!("Event capacity must be greater than zero");
        }

        self.telemetry.validate()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .server
            .bind_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.server.bind_address, e))?;
        Ok(SocketAddr::new(ip, self.server.port))
    }

    /// Catalog database location
    pub fn database_path(&self) -> PathBuf {
        self.library.data_dir.join("media-sync.db")
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.library.root.join(THUMBNAIL_DIR)
    }

    pub fn audio_filter(&self) -> Result<AudioFilter> {
        Ok(AudioFilter::new(AudioFilterOptions {
            extensions: self.library.audio_extensions.clone(),
            include_hidden: self.library.include_hidden,
        })?)
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            linux_mount_point: self.device.linux_mount_point.clone(),
            use_sudo: self.device.use_sudo,
            extra_system_volumes: self.device.extra_system_volumes.clone(),
            volumes_dir: self.device.volumes_dir.clone(),
        }
    }

    pub fn downloader_options(&self) -> DownloaderOptions {
        DownloaderOptions {
            program: self.acquisition.downloader.clone(),
            program_args: self.acquisition.downloader_args.clone(),
            extra_args: self.acquisition.extra_args.clone(),
            temp_dir: self.acquisition.temp_dir.clone(),
            audio_format: self.acquisition.audio_format.clone(),
            audio_quality: self.acquisition.audio_quality.clone(),
        }
    }

    pub fn service_options(&self) -> Result<ServiceOptions> {
        Ok(ServiceOptions {
            library_root: self.library.root.clone(),
            poll_interval: self.device.poll_interval,
            event_capacity: self.events.capacity,
            filter: self.audio_filter()?,
        })
    }
}

// Default value functions
fn default_true() -> bool { true }

fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3001 }

fn default_library_root() -> PathBuf {
    dirs::audio_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-sync")
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-sync")
}

fn default_audio_extensions() -> Vec<String> {
    DEFAULT_AUDIO_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
}

fn default_poll_interval() -> Duration { Duration::from_secs(3) }
fn default_linux_mount_point() -> PathBuf { PathBuf::from(DEFAULT_LINUX_MOUNT_POINT) }
fn default_volumes_dir() -> PathBuf { PathBuf::from("/Volumes") }

fn default_downloader() -> String { "yt-dlp".to_string() }
fn default_temp_dir() -> PathBuf { std::env::temp_dir() }
fn default_audio_format() -> String { "mp3".to_string() }
fn default_audio_quality() -> String { "128K".to_string() }

fn default_event_capacity() -> usize { DEFAULT_EVENT_CAPACITY }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: MediaSyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.device.poll_interval, Duration::from_secs(3));
        assert_eq!(config.device.linux_mount_point, PathBuf::from("/media/alarm-clock"));
        assert_eq!(config.acquisition.downloader, "yt-dlp");
        assert_eq!(config.acquisition.audio_quality, "128K");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: MediaSyncConfig = toml::from_str(
            r#"
            [library]
            root = "/srv/media"
            data_dir = "/var/lib/media-sync"

            [device]
            poll_interval = "500ms"
            use_sudo = false

            [acquisition]
            extra_args = ["--js-runtimes", "node"]
            "#,
        )
        .unwrap();

        assert_eq!(config.device.poll_interval, Duration::from_millis(500));
        assert!(!config.device.use_sudo);
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/media-sync/media-sync.db"));
        assert_eq!(config.thumbnail_dir(), PathBuf::from("/srv/media/.thumbnails"));
        assert_eq!(
            config.downloader_options().download_args(1, "https://x.test")[11..],
            ["--js-runtimes".to_string(), "node".to_string(), "https://x.test".to_string()]
        );
        assert_eq!(config.library.audio_extensions.len(), DEFAULT_AUDIO_EXTENSIONS.len());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MediaSyncConfig::default();
        config.server.bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = MediaSyncConfig::default();
        config.device.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MediaSyncConfig::default();
        config.device.linux_mount_point = PathBuf::from("relative/mount");
        assert!(config.validate().is_err());

        let mut config = MediaSyncConfig::default();
        config.library.audio_extensions.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/media-sync.toml");

        let mut config = MediaSyncConfig::default();
        config.server.port = 4000;
        config.device.extra_system_volumes = vec!["Backup".to_string()];
        config.save(&path).await.unwrap();

        let loaded = MediaSyncConfig::load(&path).await.unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.device.extra_system_volumes, vec!["Backup".to_string()]);
        assert_eq!(loaded.device.poll_interval, config.device.poll_interval);
    }
}
