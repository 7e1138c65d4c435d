//! Volume snapshot assignment: one replica snapshot per snapshot and node

use super::manager::NodeManager;
use crate::crd::{LocalVolumeReplicaSnapshot, LocalVolumeReplicaSnapshotSpec, LocalVolumeSnapshot};
use crate::error::{Error, Result};
use crate::store::get_optional;
use crate::utils::generate_name;
use std::collections::HashMap;
use tracing::{debug, info};

impl NodeManager {
    pub(super) async fn process_volume_snapshot(&self, name: &str) -> Result<()> {
        debug!(snapshot = %name, "Processing volume snapshot task assignment");
        let Some(snapshot) = get_optional(self.stores.volume_snapshots.as_ref(), name).await? else {
            debug!(snapshot = %name, "Volume snapshot not found, should be deleted already");
            return Ok(());
        };

        // deletion of replica snapshots is driven by the cluster controller
        if snapshot.spec.delete {
            return Ok(());
        }
        if !snapshot.is_assigned_to(&self.name) {
            debug!(snapshot = %name, "Volume snapshot is not assigned to this node");
            return Ok(());
        }

        let mut records = self.records.lock().await;
        if let Some(existing) = records.replica_snapshots.get(name) {
            debug!(snapshot = %name, replica_snapshot = %existing, "Replica snapshot already exists on this node");
            return Ok(());
        }

        let replica_snapshot = self.new_replica_snapshot(&snapshot, &records.replicas).await?;
        let created = self.stores.replica_snapshots.create(&replica_snapshot).await?;
        let created_name = created.metadata.name.unwrap_or_default();
        info!(snapshot = %name, replica_snapshot = %created_name, "Created volume replica snapshot");
        records.replica_snapshots.insert(name.to_string(), created_name);
        Ok(())
    }

    async fn new_replica_snapshot(
        &self,
        snapshot: &LocalVolumeSnapshot,
        replicas: &HashMap<String, String>,
    ) -> Result<LocalVolumeReplicaSnapshot> {
        let snapshot_name = snapshot.metadata.name.clone().unwrap_or_default();
        let source_volume = &snapshot.spec.source_volume;

        let replica = match replicas.get(source_volume) {
            Some(replica_name) => get_optional(self.stores.replicas.as_ref(), replica_name).await?,
            None => None,
        }
        .ok_or_else(|| Error::ReplicaNotFound(source_volume.clone()))?;

        Ok(LocalVolumeReplicaSnapshot::new(
            &generate_name(&snapshot_name),
            LocalVolumeReplicaSnapshotSpec {
                node_name: self.name.clone(),
                source_volume: source_volume.clone(),
                source_volume_replica: replica.metadata.name.clone().unwrap_or_default(),
                pool_name: replica.spec.pool_name.clone(),
                volume_snapshot_name: snapshot_name,
                required_capacity_bytes: snapshot.spec.required_capacity_bytes,
                delete: false,
            },
        ))
    }
}
