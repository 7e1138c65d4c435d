//! Volume replica snapshot manager

use super::dd::DdExecutor;
use super::lvm::LvmExecutor;
use super::registry::LocalRegistry;
use crate::crd::{
    LocalVolumeReplicaSnapshot, LocalVolumeReplicaSnapshotRestore,
    LocalVolumeReplicaSnapshotStatus,
};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct SnapshotManager {
    lvm: Arc<LvmExecutor>,
    dd: DdExecutor,
    registry: Arc<LocalRegistry>,
}

impl SnapshotManager {
    pub fn new(lvm: Arc<LvmExecutor>, dd: DdExecutor, registry: Arc<LocalRegistry>) -> Self {
        Self { lvm, dd, registry }
    }

    /// Snapshots share the cluster-wide snapshot name, so a second request
    /// for the same snapshot is a no-op
    pub async fn create_volume_replica_snapshot(
        &self,
        snapshot: &LocalVolumeReplicaSnapshot,
    ) -> Result<()> {
        let spec = &snapshot.spec;
        debug!(
            snapshot = %snapshot.metadata.name.as_deref().unwrap_or_default(),
            pool = %spec.pool_name,
            size = spec.required_capacity_bytes,
            "Creating volume replica snapshot"
        );

        if self.registry.volume_replica(&spec.source_volume).is_none() {
            error!(volume = %spec.source_volume, "Source volume replica is not on this node");
            return Err(Error::ReplicaNotFound(spec.source_volume.clone()));
        }
        if self.lvm.lv_exists(&spec.volume_snapshot_name).await? {
            info!(snapshot = %spec.volume_snapshot_name, "Snapshot already exists");
            return Ok(());
        }
        self.lvm.create_snapshot(snapshot).await
    }

    pub async fn delete_volume_replica_snapshot(
        &self,
        snapshot: &LocalVolumeReplicaSnapshot,
    ) -> Result<()> {
        self.lvm.delete_snapshot(snapshot).await
    }

    pub async fn get_volume_replica_snapshot(
        &self,
        snapshot: &LocalVolumeReplicaSnapshot,
    ) -> Result<LocalVolumeReplicaSnapshotStatus> {
        self.lvm.get_snapshot(snapshot).await
    }

    /// Start merging the snapshot into its source volume
    pub async fn rollback_volume_replica_snapshot(
        &self,
        restore: &LocalVolumeReplicaSnapshotRestore,
    ) -> Result<()> {
        self.lvm
            .rollback_snapshot(
                &restore.spec.target_pool_name,
                &restore.spec.source_volume_snapshot,
            )
            .await
    }

    /// Copy the snapshot into the restore's target volume
    pub async fn restore_volume_replica_snapshot(
        &self,
        restore: &LocalVolumeReplicaSnapshotRestore,
    ) -> Result<()> {
        self.dd.restore(restore).await
    }
}
