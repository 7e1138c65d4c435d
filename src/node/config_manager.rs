//! Replication configuration of this node's replicas
//!
//! Wraps the [`Configurer`] with the volume lookups it needs: the replica
//! layout lives on the `LocalVolume`, and HA replicas expose a device path
//! that differs from their logical volume.

use crate::config::SystemConfig;
use crate::configer::{new_configurer, Configurer, StatusSyncFn};
use crate::crd::{HAState, LocalVolume, LocalVolumeReplica, State, VolumeConfig};
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::store::{get_optional, SharedStore, Stores};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const SYNC_REPLICA_STATUS_QUEUE: &str = "SyncReplicaStatus";

/// `/dev/<pool>-HA/<volume>`
pub fn ha_device_path(replica: &LocalVolumeReplica) -> String {
    format!(
        "/dev/{}-HA/{}",
        replica.spec.pool_name, replica.spec.volume_name
    )
}

pub struct ConfigManager {
    hostname: String,
    configer: Arc<dyn Configurer>,
    volumes: SharedStore<LocalVolume>,
    replicas: SharedStore<LocalVolumeReplica>,
    sync_queue: Arc<TaskQueue>,
}

impl ConfigManager {
    pub fn new(
        hostname: &str,
        system: &SystemConfig,
        exec: Arc<dyn CommandExecutor>,
        stores: &Stores,
    ) -> Self {
        let sync_queue = TaskQueue::new(SYNC_REPLICA_STATUS_QUEUE, TaskQueueConfig::default());
        let queue = sync_queue.clone();
        let sync: StatusSyncFn = Arc::new(move |replica: &str| queue.add(replica));
        Self::with_configer(
            hostname,
            new_configurer(hostname, system, exec, sync),
            stores,
            sync_queue,
        )
    }

    pub fn with_configer(
        hostname: &str,
        configer: Arc<dyn Configurer>,
        stores: &Stores,
        sync_queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            configer,
            volumes: stores.volumes.clone(),
            replicas: stores.replicas.clone(),
            sync_queue,
        }
    }

    /// Queue fed by the configurer whenever a resource changes state
    pub fn sync_queue(&self) -> &Arc<TaskQueue> {
        &self.sync_queue
    }

    /// Start the configurer, then drop configuration nothing owns anymore
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        self.configer.run(stop).await?;
        self.consistency_check().await;
        Ok(())
    }

    pub async fn consistency_check(&self) {
        info!(node = %self.hostname, "Checking replication configuration");
        let replicas: Vec<LocalVolumeReplica> = match self.replicas.list().await {
            Ok(list) => list
                .into_iter()
                .filter(|r| r.spec.node_name == self.hostname)
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list volume replicas");
                return;
            }
        };
        self.configer.consistency_check(&replicas).await;
    }

    /// The volume's replica layout
    async fn volume_config(&self, replica: &LocalVolumeReplica) -> Result<VolumeConfig> {
        let volume = self.volumes.get(&replica.spec.volume_name).await?;
        volume.spec.config.ok_or_else(|| {
            Error::not_found("VolumeConfig", &replica.spec.volume_name)
        })
    }

    fn is_primary(&self, config: &VolumeConfig) -> bool {
        config
            .replica_for(&self.hostname)
            .map(|r| r.primary)
            .unwrap_or(false)
    }

    /// Make the replica's device available at `status.devPath`.
    ///
    /// Non-HA replicas expose the logical volume itself; HA replicas get the
    /// replication device linked under `/dev/<pool>-HA/`.
    pub async fn ensure_config(&self, replica: &mut LocalVolumeReplica) -> Result<()> {
        let mut config = self.volume_config(replica).await?;
        let name = replica.metadata.name.clone().unwrap_or_default();
        let ha_path = ha_device_path(replica);
        let status = replica.status_mut();

        if !config.is_ha() {
            debug!(replica = %name, "Ensuring config for non-HA volume replica");
            status.dev_path = status.storage_path.clone();
            return Ok(());
        }

        debug!(replica = %name, "Ensuring config for HA volume replica");
        if status.dev_path.is_empty() || status.dev_path == status.storage_path {
            status.dev_path = ha_path;
        }
        let dev_path = status.dev_path.clone();
        if let Some(dir) = Path::new(&dev_path).parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::Internal(format!("create HA device directory {}: {}", dir.display(), e))
            })?;
        }

        self.configer.ensure_config(replica, &config).await?;

        if !config.initialized && config.ready_to_initialize && self.is_primary(&config) {
            self.configer.initialize(replica, &config).await?;
            config.initialized = true;
            info!(replica = %name, volume = %replica.spec.volume_name, "Replication initialized");
            self.volumes
                .patch(
                    &replica.spec.volume_name,
                    &json!({"spec": {"config": {"initialized": true}}}),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn delete_config(&self, replica: &LocalVolumeReplica) -> Result<()> {
        self.configer.delete_config(replica).await
    }

    /// Derive the replica state from the replication state of HA replicas
    pub async fn test_volume_replica(&self, replica: &mut LocalVolumeReplica) -> Result<()> {
        let config = self.volume_config(replica).await?;
        if !config.is_ha() {
            return Ok(());
        }
        let ha_state = self.configer.get_replica_ha_state(replica)?;
        apply_ha_state(replica, ha_state);
        Ok(())
    }

    /// Publish a changed HA state of `name`
    pub async fn sync_replica_status(&self, name: &str) -> Result<()> {
        let Some(mut replica) = get_optional(self.replicas.as_ref(), name).await? else {
            debug!(replica = %name, "Replica gone, skipping status sync");
            return Ok(());
        };
        let ha_state = self.configer.get_replica_ha_state(&replica)?;
        if replica.status.as_ref().and_then(|s| s.ha_state.as_ref()) == Some(&ha_state) {
            return Ok(());
        }

        debug!(replica = %name, ha_state = %ha_state.state, "Syncing replica HA state");
        apply_ha_state(&mut replica, ha_state);
        self.replicas.update_status(&replica).await?;
        Ok(())
    }
}

/// Record `ha_state` on the replica.
///
/// Only a live replica follows the replication state; creation and deletion
/// keep their own progression.
fn apply_ha_state(replica: &mut LocalVolumeReplica, ha_state: HAState) {
    let status = replica.status_mut();
    if matches!(status.state, State::Ready | State::NotReady) {
        status.state = ha_state.replica_state();
    }
    status.ha_state = Some(ha_state);
}
