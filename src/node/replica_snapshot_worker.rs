//! Replica snapshot state machine
//!
//! `(empty) -> Creating -> NotReady <-> Ready -> ToBeDeleted -> Deleted`.
//! Every step leaves a condition on the snapshot's status.

use super::manager::NodeManager;
use crate::crd::{
    set_condition, snapshot_conditions, Condition, ConditionStatus, LocalVolumeReplicaSnapshot,
    LocalVolumeReplicaSnapshotStatus, State,
};
use crate::error::{Error, Result};
use crate::store::get_optional;
use tracing::{debug, error, info};

/// Set a condition unless an identical one is already recorded
fn record_condition(
    status: &mut LocalVolumeReplicaSnapshotStatus,
    r#type: &str,
    ok: bool,
    message: impl Into<String>,
) {
    let message = message.into();
    let condition_status = if ok {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let unchanged = status
        .conditions
        .iter()
        .any(|c| c.r#type == r#type && c.status == condition_status && c.message == message);
    if unchanged {
        return;
    }
    let reason = if ok { "Succeeded" } else { "Failed" };
    set_condition(
        &mut status.conditions,
        Condition::new(r#type, condition_status, reason, message),
    );
}

impl NodeManager {
    pub(super) async fn process_replica_snapshot(&self, name: &str) -> Result<()> {
        let Some(mut snapshot) = get_optional(self.stores.replica_snapshots.as_ref(), name).await?
        else {
            info!(replica_snapshot = %name, "Replica snapshot not found, should be deleted already");
            return Ok(());
        };
        if snapshot.spec.node_name != self.name {
            return Ok(());
        }

        if snapshot.spec.delete && !snapshot.state().is_deleting() {
            snapshot.status_mut().state = State::ToBeDeleted;
            self.stores.replica_snapshots.update_status(&snapshot).await?;
            return Ok(());
        }

        debug!(replica_snapshot = %name, state = %snapshot.state(), "Processing replica snapshot");
        match snapshot.state() {
            State::Empty => self.submit_replica_snapshot(snapshot).await,
            State::Creating => self.create_replica_snapshot_on_host(snapshot).await,
            State::Ready | State::NotReady => self.check_replica_snapshot(snapshot).await,
            State::ToBeDeleted => self.delete_replica_snapshot_on_host(snapshot).await,
            State::Deleted => self.cleanup_deleted_replica_snapshot(&snapshot).await,
        }
    }

    async fn submit_replica_snapshot(&self, mut snapshot: LocalVolumeReplicaSnapshot) -> Result<()> {
        let status = snapshot.status_mut();
        status.state = State::Creating;
        record_condition(status, snapshot_conditions::SUBMIT, true, "Snapshot submitted");
        self.stores.replica_snapshots.update_status(&snapshot).await?;
        Ok(())
    }

    async fn create_replica_snapshot_on_host(
        &self,
        mut snapshot: LocalVolumeReplicaSnapshot,
    ) -> Result<()> {
        let manager = self.storage.snapshot_manager();
        let created = match manager.get_volume_replica_snapshot(&snapshot).await {
            Ok(_) => Ok(()),
            Err(Error::SnapshotNotFound(_)) => manager.create_volume_replica_snapshot(&snapshot).await,
            Err(e) => Err(e),
        };

        if let Err(e) = created {
            error!(
                replica_snapshot = %snapshot.metadata.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to create replica snapshot"
            );
            let status = snapshot.status_mut();
            status.message = e.to_string();
            record_condition(status, snapshot_conditions::CREATE, false, e.to_string());
            self.publish_replica_snapshot_failure(&snapshot).await;
            return Err(e);
        }

        let status = snapshot.status_mut();
        status.state = State::NotReady;
        status.message.clear();
        record_condition(status, snapshot_conditions::CREATE, true, "Snapshot created");
        self.stores.replica_snapshots.update_status(&snapshot).await?;
        Ok(())
    }

    /// Mirror the host's view of the snapshot
    async fn check_replica_snapshot(&self, snapshot: LocalVolumeReplicaSnapshot) -> Result<()> {
        let name = snapshot.metadata.name.clone().unwrap_or_default();
        let mut updated = snapshot.clone();

        let observed = self
            .storage
            .snapshot_manager()
            .get_volume_replica_snapshot(&snapshot)
            .await;
        let result = match observed {
            Ok(host_status) => {
                let status = updated.status_mut();
                *status = host_status;
                if status.state == State::Ready {
                    record_condition(status, snapshot_conditions::READY_OR_NOT, true, "Snapshot is ready");
                    Ok(())
                } else {
                    let message = status.message.clone();
                    record_condition(status, snapshot_conditions::READY_OR_NOT, false, message.clone());
                    Err(Error::SnapshotInvalid(format!("{}: {}", name, message)))
                }
            }
            Err(e) => {
                error!(replica_snapshot = %name, error = %e, "Failed to inspect replica snapshot");
                let status = updated.status_mut();
                status.state = State::NotReady;
                status.message = e.to_string();
                record_condition(status, snapshot_conditions::READY_OR_NOT, false, e.to_string());
                Err(e)
            }
        };

        if updated.status != snapshot.status {
            self.stores.replica_snapshots.update_status(&updated).await?;
        }
        result
    }

    async fn delete_replica_snapshot_on_host(
        &self,
        mut snapshot: LocalVolumeReplicaSnapshot,
    ) -> Result<()> {
        let manager = self.storage.snapshot_manager();
        match manager.get_volume_replica_snapshot(&snapshot).await {
            Ok(_) => manager.delete_volume_replica_snapshot(&snapshot).await?,
            Err(Error::SnapshotNotFound(_)) => {
                debug!(snapshot = %snapshot.spec.volume_snapshot_name, "Snapshot already gone from host");
            }
            Err(e) => return Err(e),
        }

        let status = snapshot.status_mut();
        status.state = State::Deleted;
        record_condition(status, snapshot_conditions::DELETE, true, "Snapshot deleted");
        self.stores.replica_snapshots.update_status(&snapshot).await?;
        info!(
            replica_snapshot = %snapshot.metadata.name.as_deref().unwrap_or_default(),
            "Replica snapshot deleted from host"
        );
        Ok(())
    }

    async fn cleanup_deleted_replica_snapshot(
        &self,
        snapshot: &LocalVolumeReplicaSnapshot,
    ) -> Result<()> {
        let name = snapshot.metadata.name.clone().unwrap_or_default();
        match self.stores.replica_snapshots.delete(&name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        self.records
            .lock()
            .await
            .replica_snapshots
            .remove(&snapshot.spec.volume_snapshot_name);
        Ok(())
    }

    async fn publish_replica_snapshot_failure(&self, snapshot: &LocalVolumeReplicaSnapshot) {
        if let Err(e) = self.stores.replica_snapshots.update_status(snapshot).await {
            debug!(error = %e, "Failed to publish replica snapshot failure");
        }
    }
}
