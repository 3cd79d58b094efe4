//! Linux probe built on `lsblk`, `mount` and `umount`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use media_sync_core::RemovableDevice;
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{run_privileged, run_tool, volume_capacity, volume_label, DeviceProbe, ProbeOptions};
use crate::error::{Result, SyncError};

const LSBLK_ARGS: [&str; 3] = ["-J", "-o", "NAME,MOUNTPOINT,RM,SIZE,LABEL"];

/// Top-level `lsblk -J` document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LsblkOutput {
    #[serde(default)]
    pub blockdevices: Vec<LsblkDevice>,
}

/// One block device or partition as reported by `lsblk -J`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(default)]
    pub mountpoint: Option<String>,
    /// Older util-linux prints `"1"`/`"0"`, newer prints a boolean
    #[serde(default, deserialize_with = "flag")]
    pub rm: bool,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<LsblkDevice>>,
}

impl LsblkDevice {
    fn has_size(&self) -> bool {
        self.size.as_deref().is_some_and(|size| !size.is_empty() && size != "0B")
    }

    fn mount_path(&self) -> Option<&str> {
        self.mountpoint.as_deref().filter(|m| !m.is_empty())
    }
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
        Number(u8),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(value)) => value,
        Some(Flag::Text(text)) => matches!(text.trim(), "1" | "true"),
        Some(Flag::Number(n)) => n != 0,
        None => false,
    })
}

/// Pick the partition to use from an `lsblk` device list.
///
/// Only removable disks are considered. A partitioned disk yields its first
/// partition with a nonzero size; a disk without a partition table is used
/// directly, but only when it is already mounted.
pub fn find_removable_partition(devices: &[LsblkDevice]) -> Option<&LsblkDevice> {
    for device in devices.iter().filter(|d| d.rm) {
        match device.children.as_deref() {
            Some(children) => {
                if let Some(partition) = children.iter().find(|c| c.has_size()) {
                    return Some(partition);
                }
            }
            None => {
                if device.has_size() && device.mount_path().is_some() {
                    return Some(device);
                }
            }
        }
    }
    None
}

/// Find the device or partition currently mounted at `mount_path`
pub fn find_by_mount_point<'a>(devices: &'a [LsblkDevice], mount_path: &Path) -> Option<&'a LsblkDevice> {
    devices.iter().find_map(|device| {
        if device.mount_path().map(Path::new) == Some(mount_path) {
            return Some(device);
        }
        device
            .children
            .as_deref()
            .and_then(|children| find_by_mount_point(children, mount_path))
    })
}

/// Probe backed by `lsblk`.
///
/// A partition that was ejected stays ignored while it is still listed, so
/// the next poll does not mount it straight back.
#[derive(Debug)]
pub struct LinuxProbe {
    options: ProbeOptions,
    ejected: Mutex<Option<String>>,
}

impl LinuxProbe {
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            ejected: Mutex::new(None),
        }
    }

    async fn list_block_devices(&self) -> Result<LsblkOutput> {
        let stdout = run_tool("lsblk", LSBLK_ARGS).await?;
        Ok(serde_json::from_str(&stdout)?)
    }

    /// Mount `name` at the fixed mount point owned by the invoking user.
    ///
    /// FAT and exFAT take uid/gid options directly; anything else is mounted
    /// plainly and then chowned.
    #[instrument(skip(self), fields(mount_point = %self.options.linux_mount_point.display()))]
    async fn mount(&self, name: &str) -> Result<PathBuf> {
        let sudo = self.options.use_sudo;
        let target = self.options.linux_mount_point.to_string_lossy().into_owned();
        let source = format!("/dev/{}", name);
        let (uid, gid) = invoking_user();

        run_privileged(sudo, "mkdir", &["-p", target.as_str()]).await?;

        let owned = format!("uid={},gid={},umask=022", uid, gid);
        if let Err(e) = run_privileged(sudo, "mount", &[source.as_str(), target.as_str(), "-o", owned.as_str()]).await {
            debug!(error = %e, "Mount with ownership options failed, retrying plain mount");
            run_privileged(sudo, "mount", &[source.as_str(), target.as_str()]).await?;
            let owner = format!("{}:{}", uid, gid);
            run_privileged(sudo, "chown", &["-R", owner.as_str(), target.as_str()]).await?;
        }

        info!(device = %source, "Mounted removable partition");
        Ok(self.options.linux_mount_point.clone())
    }
}

#[async_trait]
impl DeviceProbe for LinuxProbe {
    async fn probe(&self) -> Result<Option<RemovableDevice>> {
        let listing = self.list_block_devices().await?;
        let partition = find_removable_partition(&listing.blockdevices);

        {
            let mut ejected = self.ejected.lock().await;
            if let Some(name) = ejected.clone() {
                match partition {
                    Some(p) if p.name == name && p.mount_path().is_none() => return Ok(None),
                    _ => *ejected = None,
                }
            }
        }

        let Some(partition) = partition else {
            return Ok(None);
        };

        let mount_path = match partition.mount_path() {
            Some(path) => PathBuf::from(path),
            None => self.mount(&partition.name).await?,
        };

        let Some((total_bytes, free_bytes)) = volume_capacity(&mount_path).await else {
            warn!(mount_path = %mount_path.display(), "Could not read capacity of removable volume");
            return Ok(None);
        };

        Ok(Some(RemovableDevice {
            label: volume_label(partition.label.as_deref(), &mount_path),
            mount_path,
            total_bytes,
            free_bytes,
        }))
    }

    async fn eject(&self, device: &RemovableDevice) -> Result<()> {
        let target = path_arg(&device.mount_path)?;
        let name = match self.list_block_devices().await {
            Ok(listing) => find_by_mount_point(&listing.blockdevices, &device.mount_path).map(|d| d.name.clone()),
            Err(e) => {
                debug!(error = %e, "Could not resolve partition before unmount");
                None
            }
        };

        run_privileged(self.options.use_sudo, "umount", &[target]).await?;
        info!(mount_path = %target, partition = ?name, "Unmounted removable volume");
        *self.ejected.lock().await = name;
        Ok(())
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| SyncError::path_error(path, "Mount path is not valid UTF-8"))
}

#[cfg(unix)]
fn invoking_user() -> (u32, u32) {
    (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
}

#[cfg(not(unix))]
fn invoking_user() -> (u32, u32) {
    (1000, 1000)
}
