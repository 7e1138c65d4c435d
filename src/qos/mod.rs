//! Per-volume IO limits

pub mod cgroups;

pub use cgroups::{CgroupMode, DeviceNumber, IoLimits, VolumeCgroups};

use crate::crd::{LocalVolumeReplica, VolumeQoS};
use crate::error::Result;
use crate::exec::{CommandExecutor, ExecParams};
use crate::utils::parse_quantity;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse the replica's QoS strings; empty and "0" are unlimited
pub fn parse_volume_qos(qos: &VolumeQoS) -> Result<IoLimits> {
    Ok(IoLimits {
        iops: parse_quantity(&qos.iops)?,
        throughput: parse_quantity(&qos.throughput)?,
    })
}

/// Device the limits apply to; the LV itself when known
fn volume_device_path(replica: &LocalVolumeReplica) -> &str {
    match replica.status.as_ref() {
        Some(s) if !s.storage_path.is_empty() => &s.storage_path,
        Some(s) => &s.dev_path,
        None => "",
    }
}

pub struct VolumeQoSManager {
    cgroups: VolumeCgroups,
    exec: Arc<dyn CommandExecutor>,
}

impl VolumeQoSManager {
    pub fn new(cgroup_root: &Path, exec: Arc<dyn CommandExecutor>) -> Self {
        let mode = CgroupMode::detect(cgroup_root);
        match mode {
            CgroupMode::Unavailable => {
                warn!(root = %cgroup_root.display(), "cgroups not available, volume QoS disabled")
            }
            _ => info!(?mode, "Detected cgroup mode"),
        }
        Self::with_cgroups(VolumeCgroups::for_mode(cgroup_root, mode), exec)
    }

    pub fn with_cgroups(cgroups: VolumeCgroups, exec: Arc<dyn CommandExecutor>) -> Self {
        Self { cgroups, exec }
    }

    /// Whether the device carries a filesystem or partition table.
    ///
    /// Throttling a device that mkfs is still writing can hang mkfs.
    pub async fn is_filesystem_initialized(&self, replica: &LocalVolumeReplica) -> bool {
        let device = volume_device_path(replica);
        if device.is_empty() {
            return false;
        }
        let params = ExecParams::new(
            "blkid",
            ["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export", device],
        );
        match self.exec.run(params).await {
            Ok(result) => result.success() && !result.stdout.trim().is_empty(),
            Err(e) => {
                debug!(device, error = %e, "Failed to detect filesystem");
                false
            }
        }
    }

    pub async fn configure_qos_for_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let limits = parse_volume_qos(&replica.spec.volume_qos)?;
        if self.cgroups == VolumeCgroups::Noop {
            return Ok(());
        }
        if !self.is_filesystem_initialized(replica).await {
            debug!(
                replica = replica.metadata.name.as_deref().unwrap_or_default(),
                "Filesystem not initialized yet, skipping QoS"
            );
            return Ok(());
        }

        let device_path = volume_device_path(replica);
        let device = DeviceNumber::of(device_path).await?;
        debug!(device = %device_path, %device, iops = limits.iops, throughput = limits.throughput, "Configuring volume QoS");
        self.cgroups.configure_device(device, limits).await
    }
}
