//! Replica snapshot restore state machine
//!
//! `(empty) -> Submitted -> InProgress -> Completed`, or
//! `ToBeAborted -> Aborted` when aborted before completion.

use super::manager::NodeManager;
use super::mount::volume_mount_points;
use crate::crd::{LocalVolumeReplicaSnapshotRestore, RestoreState, RestoreType};
use crate::error::{Error, Result};
use crate::store::get_optional;
use serde_json::json;
use tracing::{debug, error, info};

/// Where a rollback's snapshot stands on the host
#[derive(Debug, PartialEq)]
enum MergeProgress {
    /// Snapshot consumed by its origin
    Merged,
    /// Snapshot present and not merging
    Idle,
}

fn set_state(restore: &mut LocalVolumeReplicaSnapshotRestore, state: RestoreState) {
    restore.status.get_or_insert_with(Default::default).state = state;
}

fn set_message(restore: &mut LocalVolumeReplicaSnapshotRestore, message: impl Into<String>) {
    restore.status.get_or_insert_with(Default::default).message = message.into();
}

impl NodeManager {
    pub(super) async fn process_snapshot_restore(&self, name: &str) -> Result<()> {
        let Some(mut restore) =
            get_optional(self.stores.snapshot_restores.as_ref(), name).await?
        else {
            info!(restore = %name, "Snapshot restore not found, should be deleted already");
            return Ok(());
        };
        if restore.spec.node_name != self.name {
            return Ok(());
        }

        let state = restore.state();
        if restore.spec.abort && !matches!(state, RestoreState::ToBeAborted | RestoreState::Aborted) {
            set_state(&mut restore, RestoreState::ToBeAborted);
            self.stores.snapshot_restores.update_status(&restore).await?;
            return Ok(());
        }

        debug!(restore = %name, state = %state, target = %restore.spec.target_volume, "Processing snapshot restore");
        match state {
            RestoreState::Empty => {
                set_state(&mut restore, RestoreState::Submitted);
                self.stores.snapshot_restores.update_status(&restore).await?;
                Ok(())
            }
            RestoreState::Submitted => self.precheck_snapshot_restore(restore).await,
            RestoreState::InProgress => self.run_snapshot_restore(restore).await,
            RestoreState::ToBeAborted => {
                set_state(&mut restore, RestoreState::Aborted);
                self.stores.snapshot_restores.update_status(&restore).await?;
                Ok(())
            }
            RestoreState::Aborted => {
                match self.stores.snapshot_restores.delete(name).await {
                    Err(e) if !e.is_not_found() => Err(e),
                    _ => Ok(()),
                }
            }
            // the volume-level restore removes completed ones
            RestoreState::Completed => Ok(()),
        }
    }

    /// Refuse to touch a target volume that is mounted anywhere
    async fn precheck_snapshot_restore(
        &self,
        mut restore: LocalVolumeReplicaSnapshotRestore,
    ) -> Result<()> {
        let spec = &restore.spec;
        self.stores.volumes.get(&spec.target_volume).await?;

        let mount_points = volume_mount_points(
            &self.options.system.mount_table,
            &spec.target_pool_name,
            &spec.target_volume,
        )
        .await?;
        if !mount_points.is_empty() {
            let err = Error::DeviceMounted {
                device: format!("/dev/{}/{}", spec.target_pool_name, spec.target_volume),
                mount_points,
            };
            error!(restore = %restore.metadata.name.as_deref().unwrap_or_default(), error = %err, "Target volume is mounted");
            let message = format!(
                "target volume is already mounted, cannot {} from snapshot now",
                restore.spec.restore_type
            );
            set_message(&mut restore, message);
            self.publish_restore_failure(&restore).await;
            return Err(err);
        }

        set_state(&mut restore, RestoreState::InProgress);
        self.stores.snapshot_restores.update_status(&restore).await?;
        Ok(())
    }

    async fn run_snapshot_restore(&self, mut restore: LocalVolumeReplicaSnapshotRestore) -> Result<()> {
        let result = match restore.spec.restore_type {
            RestoreType::Rollback => self.rollback_snapshot(&restore).await,
            RestoreType::Create => {
                self.storage
                    .snapshot_manager()
                    .restore_volume_replica_snapshot(&restore)
                    .await
            }
        };

        if let Err(e) = result {
            set_message(&mut restore, e.to_string());
            self.publish_restore_failure(&restore).await;
            return Err(e);
        }

        set_message(&mut restore, "restore volume successfully");
        set_state(&mut restore, RestoreState::Completed);
        self.stores.snapshot_restores.update_status(&restore).await?;
        info!(restore = %restore.metadata.name.as_deref().unwrap_or_default(), "Snapshot restore completed");
        Ok(())
    }

    /// Merge the snapshot into its source volume.
    ///
    /// The merge runs in the background; a merging snapshot fails with
    /// [`Error::SnapshotMerging`] so the restore is checked again later.
    async fn rollback_snapshot(&self, restore: &LocalVolumeReplicaSnapshotRestore) -> Result<()> {
        let Some(replica_snapshot) = get_optional(
            self.stores.replica_snapshots.as_ref(),
            &restore.spec.source_volume_replica_snapshot,
        )
        .await?
        else {
            info!(snapshot = %restore.spec.source_volume_replica_snapshot, "Replica snapshot already merged");
            return Ok(());
        };

        if self.merge_progress(&replica_snapshot).await? == MergeProgress::Merged {
            return Ok(());
        }
        self.storage
            .snapshot_manager()
            .rollback_volume_replica_snapshot(restore)
            .await?;
        self.merge_progress(&replica_snapshot).await.map(|_| ())
    }

    async fn merge_progress(
        &self,
        replica_snapshot: &crate::crd::LocalVolumeReplicaSnapshot,
    ) -> Result<MergeProgress> {
        let name = replica_snapshot.metadata.name.clone().unwrap_or_default();
        let status = match self
            .storage
            .snapshot_manager()
            .get_volume_replica_snapshot(replica_snapshot)
            .await
        {
            Ok(status) => status,
            Err(Error::SnapshotNotFound(_)) => {
                info!(replica_snapshot = %name, "Snapshot merged, releasing replica snapshot");
                self.stores
                    .replica_snapshots
                    .patch(&name, &json!({"spec": {"delete": true}}))
                    .await?;
                return Ok(MergeProgress::Merged);
            }
            Err(e) => return Err(e),
        };

        if status.attr.invalid {
            return Err(Error::SnapshotInvalid(format!(
                "{} cannot be used to rollback",
                replica_snapshot.spec.volume_snapshot_name
            )));
        }
        if status.attr.merging {
            return Err(Error::SnapshotMerging(
                replica_snapshot.spec.volume_snapshot_name.clone(),
            ));
        }
        Ok(MergeProgress::Idle)
    }

    async fn publish_restore_failure(&self, restore: &LocalVolumeReplicaSnapshotRestore) {
        if let Err(e) = self.stores.snapshot_restores.update_status(restore).await {
            debug!(error = %e, "Failed to publish snapshot restore failure");
        }
    }
}
