//! Replication configurator
//!
//! HA volumes keep their replicas byte-consistent through block-level
//! replication. The [`Configurer`] trait hides the replication technology;
//! [`new_configurer`] picks the implementation for the system mode.

pub mod drbd;
pub mod events;

pub use drbd::DrbdConfigurer;
pub use events::{Event, Resource, ResourceCache};

use crate::config::{SystemConfig, SystemMode};
use crate::crd::{HAState, LocalVolumeReplica, VolumeConfig};
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Called with a replica name whenever its replication state changed
pub type StatusSyncFn = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Configurer: Send + Sync {
    /// Prepare on-host state; called once at startup
    async fn run(&self, stop: CancellationToken) -> Result<()>;

    /// Whether the replication resource of `replica` has been observed
    fn has_config(&self, replica: &LocalVolumeReplica) -> bool;

    /// Whether `config` differs from what was last applied for `replica`
    fn is_config_updated(&self, replica: &LocalVolumeReplica, config: &VolumeConfig) -> bool;

    /// Write and apply the resource configuration; idempotent
    async fn ensure_config(&self, replica: &LocalVolumeReplica, config: &VolumeConfig)
        -> Result<()>;

    /// Mark the local device up to date once every peer is connected
    async fn initialize(&self, replica: &LocalVolumeReplica, config: &VolumeConfig) -> Result<()>;

    /// Tear the resource down and remove its configuration
    async fn delete_config(&self, replica: &LocalVolumeReplica) -> Result<()>;

    fn get_replica_ha_state(&self, replica: &LocalVolumeReplica) -> Result<HAState>;

    /// Remove configuration left behind for resources not in `replicas`
    async fn consistency_check(&self, replicas: &[LocalVolumeReplica]);
}

/// Configurer for a node without replication
#[derive(Debug, Default)]
pub struct NoneConfigurer;

#[async_trait]
impl Configurer for NoneConfigurer {
    async fn run(&self, _stop: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn has_config(&self, _replica: &LocalVolumeReplica) -> bool {
        false
    }

    fn is_config_updated(&self, _replica: &LocalVolumeReplica, _config: &VolumeConfig) -> bool {
        false
    }

    async fn ensure_config(
        &self,
        replica: &LocalVolumeReplica,
        _config: &VolumeConfig,
    ) -> Result<()> {
        Err(Error::Configuration(format!(
            "replication is disabled, cannot configure HA volume {}",
            replica.spec.volume_name
        )))
    }

    async fn initialize(&self, _replica: &LocalVolumeReplica, _config: &VolumeConfig) -> Result<()> {
        Ok(())
    }

    async fn delete_config(&self, _replica: &LocalVolumeReplica) -> Result<()> {
        Ok(())
    }

    fn get_replica_ha_state(&self, replica: &LocalVolumeReplica) -> Result<HAState> {
        Err(Error::Configuration(format!(
            "replication is disabled, no HA state for {}",
            replica.spec.volume_name
        )))
    }

    async fn consistency_check(&self, _replicas: &[LocalVolumeReplica]) {}
}

pub fn new_configurer(
    hostname: &str,
    system: &SystemConfig,
    exec: Arc<dyn CommandExecutor>,
    sync: StatusSyncFn,
) -> Arc<dyn Configurer> {
    match system.mode {
        SystemMode::Drbd => Arc::new(DrbdConfigurer::new(
            hostname,
            system.drbd.clone(),
            exec,
            sync,
        )),
        SystemMode::None => Arc::new(NoneConfigurer),
    }
}
