//! Removable device detection.
//!
//! A [`DeviceProbe`] answers one question at a point in time: is a removable
//! volume present, and how big is it? The [`DeviceMonitor`] polls a probe and
//! turns its answers into connect, disconnect and swap transitions.

mod linux;
mod macos;
mod monitor;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use media_sync_core::RemovableDevice;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SyncError};

pub use linux::{find_by_mount_point, find_removable_partition, LinuxProbe, LsblkDevice, LsblkOutput};
pub use macos::{is_system_volume, MacProbe, SYSTEM_VOLUMES};
pub use monitor::{DeviceMonitor, DeviceTransition, DEFAULT_POLL_INTERVAL};

/// Default fixed mount point used when the Linux probe has to mount a partition
pub const DEFAULT_LINUX_MOUNT_POINT: &str = "/media/alarm-clock";

/// Platform-specific point-in-time device query
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Return the removable volume currently present, if any.
    ///
    /// "No device" is `Ok(None)`. Tool failures may be returned as errors;
    /// the monitor treats them as "no change this tick".
    async fn probe(&self) -> Result<Option<RemovableDevice>>;

    /// Unmount the given device so it can be unplugged safely
    async fn eject(&self, device: &RemovableDevice) -> Result<()>;
}

/// Knobs shared by the platform probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub linux_mount_point: PathBuf,
    pub use_sudo: bool,
    /// Volume names ignored on macOS on top of the built-in denylist
    pub extra_system_volumes: Vec<String>,
    pub volumes_dir: PathBuf,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            linux_mount_point: PathBuf::from(DEFAULT_LINUX_MOUNT_POINT),
            use_sudo: true,
            extra_system_volumes: Vec::new(),
            volumes_dir: PathBuf::from("/Volumes"),
        }
    }
}

/// Probe for the platform this binary was built for
pub fn platform_probe(options: ProbeOptions) -> Arc<dyn DeviceProbe> {
    if cfg!(target_os = "macos") {
        Arc::new(MacProbe::new(options))
    } else {
        Arc::new(LinuxProbe::new(options))
    }
}

/// Run an external tool to completion and return its stdout.
///
/// A nonzero exit becomes [`SyncError::Device`] carrying stderr.
pub(crate) async fn run_tool<I, S>(program: &str, args: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SyncError::Device(format!("failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::Device(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run_tool`], optionally prefixed with `sudo`
pub(crate) async fn run_privileged(use_sudo: bool, program: &str, args: &[&str]) -> Result<String> {
    if use_sudo {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(program);
        full.extend_from_slice(args);
        run_tool("sudo", full).await
    } else {
        run_tool(program, args).await
    }
}

/// Filesystem capacity of the volume holding `path` as `(total, free)` bytes.
///
/// `None` when the path cannot be queried.
pub async fn volume_capacity(path: &Path) -> Option<(u64, u64)> {
    let path = path.to_path_buf();
    match tokio::task::spawn_blocking(move || statvfs_capacity(&path)).await {
        Ok(capacity) => capacity,
        Err(e) => {
            debug!(error = %e, "Capacity query task failed");
            None
        }
    }
}

#[cfg(unix)]
fn statvfs_capacity(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;

    // SAFETY: statvfs only writes into the zeroed struct we own
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }

        let fragment = stat.f_frsize as u64;
        let total = (stat.f_blocks as u64).saturating_mul(fragment);
        let free = (stat.f_bavail as u64).saturating_mul(fragment);
        Some((total, free))
    }
}

#[cfg(not(unix))]
fn statvfs_capacity(_path: &Path) -> Option<(u64, u64)> {
    None
}

/// Display label for a volume: its filesystem label, else the mount directory name
pub(crate) fn volume_label(label: Option<&str>, mount_path: &Path) -> String {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => label.to_string(),
        None => mount_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| mount_path.display().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_label_fallback() {
        assert_eq!(volume_label(Some("SANDISK"), Path::new("/media/x")), "SANDISK");
        assert_eq!(volume_label(Some("  "), Path::new("/media/alarm-clock")), "alarm-clock");
        assert_eq!(volume_label(None, Path::new("/Volumes/KIDS")), "KIDS");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capacity_of_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let (total, free) = volume_capacity(dir.path()).await.unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    #[tokio::test]
    async fn test_capacity_of_missing_path() {
        assert_eq!(volume_capacity(Path::new("/definitely/not/here")).await, None);
    }

    #[tokio::test]
    async fn test_run_tool_reports_missing_program() {
        let err = run_tool("media-sync-no-such-tool", ["--version"]).await.unwrap_err();
        assert!(matches!(err, SyncError::Device(_)));
    }
}
