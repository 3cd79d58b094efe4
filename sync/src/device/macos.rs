//! macOS probe: scans the volumes directory for a non-system volume

use std::path::PathBuf;

use async_trait::async_trait;
use media_sync_core::RemovableDevice;
use tokio::fs;
use tracing::{debug, trace};

use super::{run_tool, volume_capacity, DeviceProbe, ProbeOptions};
use crate::error::{Result, SyncError};

/// Volume names that always belong to the host, compared case-insensitively
pub const SYSTEM_VOLUMES: [&str; 8] = [
    "macintosh hd",
    "macintosh hd - data",
    "data",
    "preboot",
    "recovery",
    "vm",
    "time machine backups",
    "efi",
];

/// Whether `name` is a host volume that must never be treated as the device
pub fn is_system_volume(name: &str, extra: &[String]) -> bool {
    let lowered = name.to_lowercase();
    SYSTEM_VOLUMES.contains(&lowered.as_str()) || extra.iter().any(|v| v.to_lowercase() == lowered)
}

#[derive(Debug, Clone)]
pub struct MacProbe {
    options: ProbeOptions,
}

impl MacProbe {
    pub fn new(options: ProbeOptions) -> Self {
        Self { options }
    }

    async fn candidate_volumes(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.options.volumes_dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || is_system_volume(&name, &self.options.extra_system_volumes) {
                trace!(volume = %name, "Skipping system volume");
                continue;
            }
            names.push(name);
        }

        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl DeviceProbe for MacProbe {
    async fn probe(&self) -> Result<Option<RemovableDevice>> {
        for name in self.candidate_volumes().await? {
            let mount_path: PathBuf = self.options.volumes_dir.join(&name);
            match volume_capacity(&mount_path).await {
                Some((total_bytes, free_bytes)) => {
                    return Ok(Some(RemovableDevice {
                        mount_path,
                        label: name,
                        total_bytes,
                        free_bytes,
                    }));
                }
                None => debug!(volume = %name, "Volume capacity unreadable, skipping"),
            }
        }
        Ok(None)
    }

    async fn eject(&self, device: &RemovableDevice) -> Result<()> {
        let target = device
            .mount_path
            .to_str()
            .ok_or_else(|| SyncError::path_error(&device.mount_path, "Mount path is not valid UTF-8"))?;
        run_tool("diskutil", ["eject", target]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("Macintosh HD", true ; "boot volume")]
    #[test_case("macintosh hd - data", true ; "data volume")]
    #[test_case("Time Machine Backups", true ; "backups")]
    #[test_case("EFI", true ; "efi")]
    #[test_case("KIDS_MP3", false ; "player")]
    #[test_case("Untitled", false ; "blank stick")]
    fn test_system_volume_denylist(name: &str, expected: bool) {
        assert_eq!(is_system_volume(name, &[]), expected);
    }

    #[test]
    fn test_extra_system_volumes() {
        let extra = vec!["Backup Drive".to_string()];
        assert!(is_system_volume("backup drive", &extra));
        assert!(!is_system_volume("KIDS", &extra));
    }

    fn probe_over(dir: &TempDir) -> MacProbe {
        MacProbe::new(ProbeOptions {
            volumes_dir: dir.path().to_path_buf(),
            ..ProbeOptions::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_first_user_volume_wins() {
        let volumes = TempDir::new().unwrap();
        for name in ["Macintosh HD", ".Spotlight-V100", "ZEBRA", "KIDS"] {
            stdfs::create_dir(volumes.path().join(name)).unwrap();
        }

        let device = probe_over(&volumes).probe().await.unwrap().unwrap();
        assert_eq!(device.label, "KIDS");
        assert_eq!(device.mount_path, volumes.path().join("KIDS"));
        assert!(device.total_bytes > 0);
    }

    #[tokio::test]
    async fn test_only_system_volumes_means_no_device() {
        let volumes = TempDir::new().unwrap();
        for name in ["Macintosh HD", "Preboot", ".fseventsd"] {
            stdfs::create_dir(volumes.path().join(name)).unwrap();
        }

        assert_eq!(probe_over(&volumes).probe().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_volumes_dir_is_an_error() {
        let volumes = TempDir::new().unwrap();
        let probe = MacProbe::new(ProbeOptions {
            volumes_dir: volumes.path().join("absent"),
            ..ProbeOptions::default()
        });
        assert!(probe.probe().await.is_err());
    }
}
