//! Volume task assignment
//!
//! Turns this node's entry in a volume's replica layout into exactly one
//! `LocalVolumeReplica`, and retires the replica when the entry goes away.

use super::manager::NodeManager;
use crate::crd::{
    set_condition, volume_conditions, Condition, ConditionStatus, LocalVolume, LocalVolumeReplica,
    LocalVolumeReplicaSpec, State,
};
use crate::error::{Error, Result};
use crate::store::get_optional;
use crate::utils::generate_name;
use tracing::{debug, info, warn};

impl NodeManager {
    pub(super) async fn process_volume(&self, name: &str) -> Result<()> {
        debug!(volume = %name, "Working on a task assignment");
        let Some(volume) = get_optional(self.stores.volumes.as_ref(), name).await? else {
            info!(volume = %name, "Volume not found, should be deleted already");
            return Ok(());
        };

        // no layout: this node may have been de-scheduled
        let Some(config) = volume.config() else {
            return self.cleanup_volume_replica(name).await;
        };
        if config.replica_for(&self.name).is_none() {
            return self.cleanup_volume_replica(name).await;
        }
        if let Err(e) = volume.spec.validate() {
            return self.reject_volume(volume, e).await;
        }

        match self.my_volume_replica(name).await? {
            None if volume.spec.delete => {
                debug!(volume = %name, "Volume replica has already been deleted");
                Ok(())
            }
            None => self.create_volume_replica(&volume).await,
            Some(replica) if volume.spec.delete => self.retire_volume_replica(replica).await,
            Some(replica) => self.update_volume_replica(replica, &volume).await,
        }
    }

    /// Record why the volume cannot be served and hand the error back
    async fn reject_volume(&self, mut volume: LocalVolume, err: Error) -> Result<()> {
        let name = volume.metadata.name.clone().unwrap_or_default();
        warn!(volume = %name, error = %err, "Invalid volume, not creating a replica");

        let before = volume.status.clone();
        set_condition(
            &mut volume.status_mut().conditions,
            Condition::new(volume_conditions::VALID, ConditionStatus::False, "Validation", err.to_string()),
        );
        // the condition carries fresh timestamps, compare without them
        let changed = before
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.r#type == volume_conditions::VALID))
            .map_or(true, |c| c.status != ConditionStatus::False || c.message != err.to_string());
        if changed {
            self.stores.volumes.update_status(&volume).await?;
        }
        Err(err)
    }

    /// This node's replica of `volume`, looked up through the records
    pub(super) async fn my_volume_replica(&self, volume: &str) -> Result<Option<LocalVolumeReplica>> {
        let name = self.records.lock().await.replicas.get(volume).cloned();
        match name {
            Some(name) => get_optional(self.stores.replicas.as_ref(), &name).await,
            None => Ok(None),
        }
    }

    async fn create_volume_replica(&self, volume: &LocalVolume) -> Result<()> {
        let volume_name = volume.metadata.name.clone().unwrap_or_default();
        // held across the create so two passes cannot both create
        let mut records = self.records.lock().await;
        if let Some(existing) = records.replicas.get(&volume_name) {
            debug!(replica = %existing, "Volume replica exists, ignoring creation");
            return Ok(());
        }

        let replica = LocalVolumeReplica::new(
            &generate_name(&volume_name),
            LocalVolumeReplicaSpec {
                volume_name: volume_name.clone(),
                pool_name: volume.spec.pool_name.clone(),
                node_name: self.name.clone(),
                required_capacity_bytes: volume.spec.required_capacity_bytes,
                volume_qos: volume.spec.volume_qos.clone(),
                delete: false,
            },
        );
        let created = self.stores.replicas.create(&replica).await?;
        let replica_name = created.metadata.name.unwrap_or_default();
        info!(volume = %volume_name, replica = %replica_name, "Created volume replica");
        records.replicas.insert(volume_name, replica_name);
        Ok(())
    }

    async fn retire_volume_replica(&self, mut replica: LocalVolumeReplica) -> Result<()> {
        let name = replica.metadata.name.clone().unwrap_or_default();
        if replica.state().is_deleting() {
            debug!(replica = %name, "Volume replica is already being deleted");
            return Ok(());
        }
        info!(replica = %name, "Marking volume replica for deletion");
        replica.status_mut().state = State::ToBeDeleted;
        self.stores.replicas.update_status(&replica).await?;
        Ok(())
    }

    /// Push capacity and QoS drift down to the replica
    async fn update_volume_replica(
        &self,
        mut replica: LocalVolumeReplica,
        volume: &LocalVolume,
    ) -> Result<()> {
        let name = replica.metadata.name.clone().unwrap_or_default();
        if volume.spec.required_capacity_bytes > replica.spec.required_capacity_bytes {
            info!(
                replica = %name,
                from = replica.spec.required_capacity_bytes,
                to = volume.spec.required_capacity_bytes,
                "Expanding volume replica capacity"
            );
            replica.spec.required_capacity_bytes = volume.spec.required_capacity_bytes;
            self.stores.replicas.update(&replica).await?;
            return Ok(());
        }
        if volume.spec.volume_qos != replica.spec.volume_qos {
            info!(replica = %name, "Updating volume replica QoS");
            replica.spec.volume_qos = volume.spec.volume_qos.clone();
            self.stores.replicas.update(&replica).await?;
            return Ok(());
        }

        self.queues.replica.add(name);
        Ok(())
    }

    async fn cleanup_volume_replica(&self, volume: &str) -> Result<()> {
        match self.my_volume_replica(volume).await? {
            Some(replica) => self.retire_volume_replica(replica).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::crd::{
        volume_conditions, ConditionStatus, LocalVolume, LocalVolumeReplica, LocalVolumeSpec,
        State, VolumeConfig, VolumeQoS, VolumeReplicaConfig,
    };
    use crate::error::{Error, ErrorAction};
    use crate::node::manager::tests::harness;
    use assert_matches::assert_matches;
    use crate::store::Store;

    fn volume(name: &str, hosts: &[&str]) -> LocalVolume {
        LocalVolume::new(
            name,
            LocalVolumeSpec {
                required_capacity_bytes: 1 << 30,
                pool_name: "LocalStorage_PoolHDD".into(),
                replica_number: hosts.len() as i64,
                config: Some(VolumeConfig {
                    volume_name: name.into(),
                    resource_id: -1,
                    replicas: hosts
                        .iter()
                        .enumerate()
                        .map(|(i, h)| VolumeReplicaConfig {
                            id: i as i64 + 1,
                            hostname: h.to_string(),
                            primary: i == 0,
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    async fn replicas_of(stores: &crate::store::Stores, volume: &str) -> Vec<LocalVolumeReplica> {
        stores
            .replicas
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.spec.volume_name == volume)
            .collect()
    }

    #[tokio::test]
    async fn test_assigned_volume_gets_one_replica() {
        let h = harness().await;
        h.stores.volumes.create(&volume("pvc-2", &["n1"])).await.unwrap();

        h.manager.process_volume("pvc-2").await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let replicas = replicas_of(&h.stores, "pvc-2").await;
        assert_eq!(replicas.len(), 1);
        let replica = &replicas[0];
        assert!(replica.metadata.name.as_deref().unwrap().starts_with("pvc-2-"));
        assert_eq!(replica.spec.node_name, "n1");
        assert_eq!(replica.spec.pool_name, "LocalStorage_PoolHDD");
        assert_eq!(replica.spec.required_capacity_bytes, 1 << 30);
    }

    #[tokio::test]
    async fn test_undersized_volume_is_rejected() {
        let h = harness().await;
        let mut tiny = volume("pvc-2", &["n1"]);
        tiny.spec.required_capacity_bytes = 1024;
        h.stores.volumes.create(&tiny).await.unwrap();

        let err = h.manager.process_volume("pvc-2").await.unwrap_err();
        assert_matches!(err, Error::Validation(_));
        assert_eq!(err.action(), ErrorAction::NoRequeue);
        assert!(replicas_of(&h.stores, "pvc-2").await.is_empty());

        let status = h.stores.volumes.get("pvc-2").await.unwrap().status.unwrap();
        let condition = &status.conditions[0];
        assert_eq!(condition.r#type, volume_conditions::VALID);
        assert_eq!(condition.status, ConditionStatus::False);

        // a second pass does not rewrite the same failure
        let version = h.stores.volumes.get("pvc-2").await.unwrap().metadata.resource_version;
        assert!(h.manager.process_volume("pvc-2").await.is_err());
        assert_eq!(
            h.stores.volumes.get("pvc-2").await.unwrap().metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn test_unassigned_volume_is_ignored() {
        let h = harness().await;
        h.stores.volumes.create(&volume("pvc-2", &["n2"])).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();
        assert!(replicas_of(&h.stores, "pvc-2").await.is_empty());

        // missing volumes are already handled
        h.manager.process_volume("pvc-missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_drift_is_pushed_to_replica() {
        let h = harness().await;
        h.stores.volumes.create(&volume("pvc-2", &["n1"])).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let mut vol = h.stores.volumes.get("pvc-2").await.unwrap();
        vol.spec.required_capacity_bytes = 2 << 30;
        vol.spec.volume_qos = VolumeQoS {
            iops: "100".into(),
            throughput: String::new(),
        };
        h.stores.volumes.update(&vol).await.unwrap();

        // capacity first, then QoS on the next pass
        h.manager.process_volume("pvc-2").await.unwrap();
        let replica = replicas_of(&h.stores, "pvc-2").await.remove(0);
        assert_eq!(replica.spec.required_capacity_bytes, 2 << 30);
        assert_eq!(replica.spec.volume_qos, VolumeQoS::default());

        h.manager.process_volume("pvc-2").await.unwrap();
        let replica = replicas_of(&h.stores, "pvc-2").await.remove(0);
        assert_eq!(replica.spec.volume_qos.iops, "100");

        // no drift left: the replica is re-checked
        h.manager.process_volume("pvc-2").await.unwrap();
        assert_eq!(h.manager.queues.replica.len(), 1);
    }

    #[tokio::test]
    async fn test_removed_assignment_retires_replica() {
        let h = harness().await;
        h.stores.volumes.create(&volume("pvc-2", &["n1"])).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let mut vol = h.stores.volumes.get("pvc-2").await.unwrap();
        vol.spec.config = Some(volume("pvc-2", &["n2"]).spec.config.unwrap());
        h.stores.volumes.update(&vol).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let replica = replicas_of(&h.stores, "pvc-2").await.remove(0);
        assert_eq!(replica.state(), State::ToBeDeleted);
    }

    #[tokio::test]
    async fn test_deleted_volume_retires_replica() {
        let h = harness().await;
        h.stores.volumes.create(&volume("pvc-2", &["n1"])).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let mut vol = h.stores.volumes.get("pvc-2").await.unwrap();
        vol.spec.delete = true;
        h.stores.volumes.update(&vol).await.unwrap();
        h.manager.process_volume("pvc-2").await.unwrap();

        let replica = replicas_of(&h.stores, "pvc-2").await.remove(0);
        assert_eq!(replica.state(), State::ToBeDeleted);
    }
}
