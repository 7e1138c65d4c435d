//! Node agent configuration
//!
//! [`SystemConfig`] is read from YAML and covers replication, cgroup and
//! data-copy settings. [`NodeConfig`] describes this node and is resolved
//! during registration.

use crate::crd::Topology;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// System Configuration
// =============================================================================

/// Replication technology used for HA volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    #[default]
    Drbd,
    /// Replication disabled; every volume is local-only
    None,
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemMode::Drbd => write!(f, "drbd"),
            SystemMode::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrbdConfig {
    /// Port of resource 0; resource `n` listens on `start_port + n`
    pub start_port: u32,
    pub config_dir: PathBuf,
    pub base_config: PathBuf,
    /// Replicated devices are `<prefix><minor>`
    pub device_prefix: String,
    pub max_peers: u32,
}

impl Default for DrbdConfig {
    fn default() -> Self {
        Self {
            start_port: 43001,
            config_dir: PathBuf::from("/etc/drbd.d"),
            base_config: PathBuf::from("/etc/drbd.conf"),
            device_prefix: "/dev/drbd".to_string(),
            max_peers: 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    pub mode: SystemMode,
    pub drbd: DrbdConfig,
    /// Upper bound of HA volumes, and so of replication ports
    pub max_ha_volume_count: u32,
    pub cgroup_root: PathBuf,
    /// Mount table consulted before restoring onto a volume
    pub mount_table: PathBuf,
    pub authorized_keys_path: PathBuf,
    /// ConfigMap that publishes the data-copy public key
    pub data_copy_key_config_map: String,
    /// Key inside that ConfigMap holding the public key
    pub data_copy_key_field: String,
    /// Data-sync jobs publish `<prefix>-<volume>` ConfigMaps
    pub data_copy_sync_config_map_prefix: String,
    /// Volumes being copied are mounted under `<root>/src` or `<root>/dst`
    pub data_copy_mount_root: PathBuf,
    /// Retries per replica key before it is dropped; 0 retries forever
    pub max_replica_retries: u32,
    pub restore_timeout_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            mode: SystemMode::Drbd,
            drbd: DrbdConfig::default(),
            max_ha_volume_count: 1000,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            mount_table: PathBuf::from("/proc/mounts"),
            authorized_keys_path: PathBuf::from("/root/.ssh/authorized_keys"),
            data_copy_key_config_map: "hwameistor-datacopy-key".to_string(),
            data_copy_key_field: "key.pub".to_string(),
            data_copy_sync_config_map_prefix: "sync-config".to_string(),
            data_copy_mount_root: PathBuf::from("/mnt/hwameistor"),
            max_replica_retries: 0,
            restore_timeout_secs: 600,
        }
    }
}

impl SystemConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SystemConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == SystemMode::Drbd {
            if self.drbd.start_port == 0 {
                return Err(Error::Configuration("drbd.startPort must be set".into()));
            }
            let last = self.drbd.start_port as u64 + self.max_ha_volume_count as u64;
            if last > u16::MAX as u64 {
                return Err(Error::Configuration(format!(
                    "replication ports {}..{} exceed the port range",
                    self.drbd.start_port, last
                )));
            }
        }
        if self.restore_timeout_secs == 0 {
            return Err(Error::Configuration(
                "restoreTimeoutSecs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

// =============================================================================
// Node Configuration
// =============================================================================

/// Identity of this node as published in its `LocalStorageNode`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "storageIP")]
    pub storage_ip: String,
    pub topology: Topology,
}

/// Everything the node manager needs to start
#[derive(Debug, Clone, Default)]
pub struct NodeManagerOptions {
    pub node_name: String,
    pub namespace: String,
    /// Node annotation holding the storage IP, checked before the node address
    pub storage_ip_annotation: Option<String>,
    pub system: SystemConfig,
}

impl NodeManagerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Configuration("node name is required".into()));
        }
        self.system.validate()
    }
}
