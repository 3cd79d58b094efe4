//! Polling monitor that owns the current-device slot

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use media_sync_core::{MediaEvent, RemovableDevice};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use uuid::Uuid;

use super::DeviceProbe;
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::sync_job::SyncJobSlot;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// What one poll tick did to the current-device slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTransition {
    Connected(RemovableDevice),
    Disconnected(PathBuf),
    /// A different mount path replaced the previous one within one tick
    Swapped {
        removed: PathBuf,
        connected: RemovableDevice,
    },
    /// Same mount path still present; capacity refreshed in place
    Refreshed,
    Unchanged,
}

/// Polls a [`DeviceProbe`] and debounces its answers into transitions.
///
/// Identity is the mount path only: a device re-probed at the same path is
/// refreshed, never reconnected. Any disconnect or swap clears the sync job
/// slot so a running job stops at its next file boundary.
#[derive(Clone)]
pub struct DeviceMonitor {
    probe: Arc<dyn DeviceProbe>,
    current: Arc<RwLock<Option<RemovableDevice>>>,
    events: EventBus,
    sync_slot: SyncJobSlot,
    poll_interval: Duration,
}

impl DeviceMonitor {
    pub fn new(probe: Arc<dyn DeviceProbe>, events: EventBus, sync_slot: SyncJobSlot) -> Self {
        Self {
            probe,
            current: Arc::new(RwLock::new(None)),
            events,
            sync_slot,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn probe(&self) -> &Arc<dyn DeviceProbe> {
        &self.probe
    }

    pub async fn current(&self) -> Option<RemovableDevice> {
        self.current.read().await.clone()
    }

    /// Claim the sync slot for the device connected right now.
    ///
    /// The device slot stays read-locked while the job is claimed, so a
    /// disconnect lands either before the claim (`NoDevice`) or after it,
    /// where it clears the new job like any running one.
    pub async fn begin_sync(&self) -> Result<(Uuid, RemovableDevice)> {
        let current = self.current.read().await;
        let device = current.clone().ok_or(SyncError::NoDevice)?;
        let job_id = self.sync_slot.try_begin().await?;
        Ok((job_id, device))
    }

    /// Probe once and apply the result. A probe error changes nothing.
    pub async fn tick(&self) -> DeviceTransition {
        match self.probe.probe().await {
            Ok(probed) => self.apply(probed).await,
            Err(e) => {
                debug!(error = %e, "Device probe failed, keeping current state");
                DeviceTransition::Unchanged
            }
        }
    }

    /// Fold one probe result into the current-device slot, publishing events
    pub async fn apply(&self, probed: Option<RemovableDevice>) -> DeviceTransition {
        let mut current = self.current.write().await;
        let known = current.as_ref().map(|device| device.mount_path.clone());

        match (known, probed) {
            (None, None) => DeviceTransition::Unchanged,
            (None, Some(device)) => {
                info!(mount_path = %device.mount_path.display(), label = %device.label, "Removable device connected");
                *current = Some(device.clone());
                self.events.publish(MediaEvent::UsbConnected(device.clone()));
                DeviceTransition::Connected(device)
            }
            (Some(removed), None) => {
                *current = None;
                self.cancel_sync().await;
                info!(mount_path = %removed.display(), "Removable device disconnected");
                self.events.publish(MediaEvent::device_removed(removed.clone()));
                DeviceTransition::Disconnected(removed)
            }
            (Some(known), Some(device)) if known == device.mount_path => {
                trace!(free_bytes = device.free_bytes, "Device capacity refreshed");
                *current = Some(device);
                DeviceTransition::Refreshed
            }
            (Some(removed), Some(device)) => {
                *current = Some(device.clone());
                self.cancel_sync().await;
                info!(
                    removed = %removed.display(),
                    mount_path = %device.mount_path.display(),
                    "Removable device swapped"
                );
                self.events.publish(MediaEvent::device_removed(removed.clone()));
                self.events.publish(MediaEvent::UsbConnected(device.clone()));
                DeviceTransition::Swapped {
                    removed,
                    connected: device,
                }
            }
        }
    }

    /// Drop the current device after a successful eject
    pub async fn forget_device(&self) -> Option<RemovableDevice> {
        let removed = self.current.write().await.take()?;
        self.cancel_sync().await;
        self.events.publish(MediaEvent::device_removed(removed.mount_path.clone()));
        Some(removed)
    }

    async fn cancel_sync(&self) {
        if let Some(job) = self.sync_slot.clear().await {
            if job.is_syncing() {
                info!(job_id = %job.id, "Device went away, cancelling sync job");
            }
        }
    }

    /// Poll on the configured interval until `cancel` fires.
    ///
    /// A probe already in flight when the token fires is allowed to finish,
    /// but its result is discarded.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?monitor.poll_interval, "Device monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let probed = monitor.probe.probe().await;
                if cancel.is_cancelled() {
                    debug!("Device monitor stopped mid-probe, discarding result");
                    break;
                }

                match probed {
                    Ok(probed) => {
                        monitor.apply(probed).await;
                    }
                    Err(e) => debug!(error = %e, "Device probe failed, keeping current state"),
                }
            }

            info!("Device monitor stopped");
        })
    }
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
