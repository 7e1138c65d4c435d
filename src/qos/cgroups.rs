//! Block IO throttling through cgroups
//!
//! The hierarchy layout is detected once under the cgroup root:
//! - unified: `<root>/cgroup.controllers` exists, limits go to `<root>/kubepods/io.max`
//! - hybrid: `<root>/unified` exists, limits go to `<root>/unified/kubepods/io.max`
//! - legacy: `<root>/blkio` exists, limits go to the `blkio.throttle.*` files

use crate::error::{Error, Result};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const BLKIO_DIR: &str = "blkio";
const UNIFIED_DIR: &str = "unified";
const CONTROLLERS_FILE: &str = "cgroup.controllers";
const KUBEPODS_IO_MAX: &str = "kubepods/io.max";

const READ_BPS: &str = "blkio.throttle.read_bps_device";
const WRITE_BPS: &str = "blkio.throttle.write_bps_device";
const READ_IOPS: &str = "blkio.throttle.read_iops_device";
const WRITE_IOPS: &str = "blkio.throttle.write_iops_device";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    Legacy,
    Hybrid,
    Unified,
    Unavailable,
}

impl CgroupMode {
    pub fn detect(root: &Path) -> Self {
        if root.join(CONTROLLERS_FILE).exists() {
            CgroupMode::Unified
        } else if root.join(UNIFIED_DIR).is_dir() {
            CgroupMode::Hybrid
        } else if root.join(BLKIO_DIR).is_dir() {
            CgroupMode::Legacy
        } else {
            CgroupMode::Unavailable
        }
    }
}

/// Major and minor number of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumber {
    pub major: u64,
    pub minor: u64,
}

impl DeviceNumber {
    /// Decode a Linux `dev_t`
    pub fn from_rdev(rdev: u64) -> Self {
        Self {
            major: ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff),
            minor: (rdev & 0xff) | ((rdev >> 12) & !0xff),
        }
    }

    pub async fn of(path: &str) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.rdev() == 0 {
            return Err(Error::Validation(format!("{} is not a device", path)));
        }
        Ok(Self::from_rdev(meta.rdev()))
    }
}

impl std::fmt::Display for DeviceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// Limits for one device; zero means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoLimits {
    pub iops: i64,
    pub throughput: i64,
}

/// Writer for the detected cgroup layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeCgroups {
    V1 { blkio: PathBuf },
    V2 { io_max: PathBuf },
    Noop,
}

impl VolumeCgroups {
    pub fn for_mode(root: &Path, mode: CgroupMode) -> Self {
        match mode {
            CgroupMode::Legacy => VolumeCgroups::V1 {
                blkio: root.join(BLKIO_DIR),
            },
            CgroupMode::Hybrid => VolumeCgroups::V2 {
                io_max: root.join(UNIFIED_DIR).join(KUBEPODS_IO_MAX),
            },
            CgroupMode::Unified => VolumeCgroups::V2 {
                io_max: root.join(KUBEPODS_IO_MAX),
            },
            CgroupMode::Unavailable => VolumeCgroups::Noop,
        }
    }

    pub async fn configure_device(&self, device: DeviceNumber, limits: IoLimits) -> Result<()> {
        match self {
            VolumeCgroups::V1 { blkio } => {
                for (file, value) in [
                    (READ_BPS, limits.throughput),
                    (WRITE_BPS, limits.throughput),
                    (READ_IOPS, limits.iops),
                    (WRITE_IOPS, limits.iops),
                ] {
                    write_control(&blkio.join(file), &format!("{} {}", device, value)).await?;
                }
                Ok(())
            }
            VolumeCgroups::V2 { io_max } => {
                let line = format!(
                    "{} rbps={} wbps={} riops={} wiops={}",
                    device,
                    v2_value(limits.throughput),
                    v2_value(limits.throughput),
                    v2_value(limits.iops),
                    v2_value(limits.iops)
                );
                write_control(io_max, &line).await
            }
            VolumeCgroups::Noop => Ok(()),
        }
    }
}

/// io.max rejects 0; `max` lifts the limit
fn v2_value(v: i64) -> String {
    if v <= 0 {
        "max".to_string()
    } else {
        v.to_string()
    }
}

/// Control files are never created, only written
async fn write_control(path: &Path, value: &str) -> Result<()> {
    debug!(file = %path.display(), value, "Writing cgroup control");
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| Error::Internal(format!("open {}: {}", path.display(), e)))?;
    file.write_all(value.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
