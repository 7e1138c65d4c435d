//! Volume replica state machine
//!
//! `(empty) -> Creating -> NotReady <-> Ready -> ToBeDeleted -> Deleted`,
//! driven one step per pass. Each step ends with a status write, which the
//! replica informer turns into the next pass.

use super::manager::NodeManager;
use crate::crd::{LocalVolumeReplica, State};
use crate::error::{Error, Result};
use crate::store::get_optional;
use tracing::{debug, error, info};

/// Smallest growth worth an `lvextend`
const EXPANSION_MIN_BYTES: i64 = 4 * 1024 * 1024;

impl NodeManager {
    pub(super) async fn process_volume_replica(&self, name: &str) -> Result<()> {
        let Some(mut replica) = get_optional(self.stores.replicas.as_ref(), name).await? else {
            info!(replica = %name, "Volume replica not found, should be deleted already");
            return Ok(());
        };
        if replica.spec.node_name != self.name {
            return Ok(());
        }

        if replica.spec.delete && !replica.state().is_deleting() {
            replica.status_mut().state = State::ToBeDeleted;
            self.stores.replicas.update_status(&replica).await?;
            return Ok(());
        }

        debug!(replica = %name, state = %replica.state(), "Processing volume replica");
        match replica.state() {
            State::Empty => self.submit_volume_replica(replica).await,
            State::Creating => self.create_volume_replica_on_host(&replica).await,
            State::Ready | State::NotReady => self.check_volume_replica(&replica).await,
            State::ToBeDeleted => self.delete_volume_replica_on_host(&replica).await,
            State::Deleted => self.cleanup_deleted_volume_replica(&replica).await,
        }
    }

    async fn submit_volume_replica(&self, mut replica: LocalVolumeReplica) -> Result<()> {
        replica.status_mut().state = State::Creating;
        self.stores.replicas.update_status(&replica).await?;
        Ok(())
    }

    async fn create_volume_replica_on_host(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let mut created = self
            .storage
            .volume_replica_manager()
            .create_volume_replica(replica)
            .await?;
        created.status_mut().state = State::NotReady;
        self.stores.replicas.update_status(&created).await?;
        Ok(())
    }

    async fn check_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let name = replica.metadata.name.as_deref().unwrap_or_default();
        let manager = self.storage.volume_replica_manager();

        if replica.spec.required_capacity_bytes > replica.allocated_bytes() + EXPANSION_MIN_BYTES {
            info!(
                replica = %name,
                allocated = replica.allocated_bytes(),
                required = replica.spec.required_capacity_bytes,
                "Expanding volume replica"
            );
            let mut expanded = manager
                .expand_volume_replica(replica, replica.spec.required_capacity_bytes)
                .await?;
            expanded.status_mut().state = State::NotReady;
            self.stores.replicas.update_status(&expanded).await?;
            return Ok(());
        }

        let mut tested = manager.test_volume_replica(replica).await?;
        self.qos.configure_qos_for_replica(&tested).await?;

        if let Err(e) = self.config_manager.ensure_config(&mut tested).await {
            error!(replica = %name, error = %e, "Failed to configure volume replica");
            return self.fail_volume_replica_check(replica, tested, e).await;
        }
        if let Err(e) = self.config_manager.test_volume_replica(&mut tested).await {
            error!(replica = %name, error = %e, "Failed to test configured volume replica");
            return self.fail_volume_replica_check(replica, tested, e).await;
        }

        if tested.status != replica.status {
            debug!(replica = %name, state = %tested.state(), "Volume replica status changed");
            self.stores.replicas.update_status(&tested).await?;
        }
        Ok(())
    }

    /// Publish NotReady, then surface the original error for retry
    async fn fail_volume_replica_check(
        &self,
        replica: &LocalVolumeReplica,
        mut tested: LocalVolumeReplica,
        err: Error,
    ) -> Result<()> {
        tested.status_mut().state = State::NotReady;
        if tested.status != replica.status {
            if let Err(e) = self.stores.replicas.update_status(&tested).await {
                debug!(error = %e, "Failed to publish NotReady state");
            }
        }
        Err(err)
    }

    async fn delete_volume_replica_on_host(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let volume = &replica.spec.volume_name;
        let snapshots = self
            .stores
            .replica_snapshots
            .list()
            .await?
            .into_iter()
            .filter(|s| &s.spec.source_volume == volume)
            .count();
        if snapshots > 0 {
            debug!(volume = %volume, snapshots, "Volume replica deletion waits for snapshots");
            return Err(Error::DependentSnapshots {
                volume: volume.clone(),
                count: snapshots,
            });
        }

        self.config_manager.delete_config(replica).await?;
        self.storage
            .volume_replica_manager()
            .delete_volume_replica(replica)
            .await?;

        let mut deleted = replica.clone();
        deleted.status_mut().state = State::Deleted;
        self.stores.replicas.update_status(&deleted).await?;
        info!(replica = %replica.metadata.name.as_deref().unwrap_or_default(), "Volume replica deleted from host");
        Ok(())
    }

    async fn cleanup_deleted_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let name = replica.metadata.name.clone().unwrap_or_default();
        match self.stores.replicas.delete(&name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        let mut records = self.records.lock().await;
        if records.replicas.get(&replica.spec.volume_name) == Some(&name) {
            records.replicas.remove(&replica.spec.volume_name);
        }
        Ok(())
    }
}
