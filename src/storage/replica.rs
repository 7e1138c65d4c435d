//! Volume replica manager
//!
//! Validates requests against the registry before touching LVM.

use super::lvm::{Inconsistency, LvmExecutor};
use super::registry::LocalRegistry;
use crate::crd::LocalVolumeReplica;
use crate::error::{Error, Result};
use crate::store::SharedStore;
use crate::utils::round_to_extent;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of validating a create request
#[derive(Debug, PartialEq)]
enum CreateCheck {
    Proceed,
    /// Replica is already on the host
    Exists(LocalVolumeReplica),
}

pub struct VolumeReplicaManager {
    node_name: String,
    lvm: Arc<LvmExecutor>,
    registry: Arc<LocalRegistry>,
    replicas: SharedStore<LocalVolumeReplica>,
}

impl VolumeReplicaManager {
    pub fn new(
        node_name: impl Into<String>,
        lvm: Arc<LvmExecutor>,
        registry: Arc<LocalRegistry>,
        replicas: SharedStore<LocalVolumeReplica>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            lvm,
            registry,
            replicas,
        }
    }

    /// Allocate the replica; an existing replica is returned as-is
    pub async fn create_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
    ) -> Result<LocalVolumeReplica> {
        let spec = &replica.spec;
        debug!(
            volume = %spec.volume_name,
            pool = %spec.pool_name,
            size = spec.required_capacity_bytes,
            "Creating volume replica"
        );

        match self.check_create(replica)? {
            CreateCheck::Exists(current) => {
                info!(volume = %spec.volume_name, "Volume replica already exists");
                let mut existing = replica.clone();
                let current = current.status.unwrap_or_default();
                let status = existing.status_mut();
                status.allocated_capacity_bytes = current.allocated_capacity_bytes;
                status.storage_path = current.storage_path;
                status.dev_path = current.dev_path;
                status.synced = current.synced;
                Ok(existing)
            }
            CreateCheck::Proceed => self.lvm.create_volume_replica(replica).await,
        }
    }

    /// Remove the replica; one that is not on the host counts as removed
    pub async fn delete_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        debug!(volume = %replica.spec.volume_name, "Deleting volume replica");
        if !self.registry.has_volume_replica(replica) {
            info!(volume = %replica.spec.volume_name, "Volume replica not found, skipping");
            return Ok(());
        }
        if self.registry.pool(&replica.spec.pool_name).is_none() {
            return Err(Error::not_found("LocalPool", &replica.spec.pool_name));
        }
        self.lvm.delete_volume_replica(replica).await
    }

    pub async fn expand_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity_bytes: i64,
    ) -> Result<LocalVolumeReplica> {
        debug!(volume = %replica.spec.volume_name, new_capacity_bytes, "Expanding volume replica");
        self.check_expand(replica, new_capacity_bytes)?;
        self.lvm
            .expand_volume_replica(replica, new_capacity_bytes)
            .await
    }

    /// Registered view of the replica
    pub fn get_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<LocalVolumeReplica> {
        self.registry
            .volume_replica(&replica.spec.volume_name)
            .ok_or_else(|| Error::ReplicaNotFound(replica.spec.volume_name.clone()))
    }

    pub async fn test_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
    ) -> Result<LocalVolumeReplica> {
        self.lvm.test_volume_replica(replica).await
    }

    /// Log differences between this node's declared replicas and the host
    pub async fn consistency_check(&self) -> Vec<Inconsistency> {
        debug!(node = %self.node_name, "Consistency checking");
        let declared: BTreeMap<String, LocalVolumeReplica> = match self.replicas.list().await {
            Ok(list) => list
                .into_iter()
                .filter(|r| r.spec.node_name == self.node_name)
                .map(|r| (r.spec.volume_name.clone(), r))
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list volume replicas");
                return Vec::new();
            }
        };

        match self.lvm.consistency_check(&declared).await {
            Ok(found) => {
                debug!(inconsistencies = found.len(), "Consistency check completed");
                found
            }
            Err(e) => {
                error!(error = %e, "Consistency check failed");
                Vec::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    fn check_create(&self, replica: &LocalVolumeReplica) -> Result<CreateCheck> {
        let spec = &replica.spec;
        let pool = self
            .registry
            .pool(&spec.pool_name)
            .ok_or_else(|| Error::not_found("LocalPool", &spec.pool_name))?;

        if let Some(current) = self.registry.volume_replica(&spec.volume_name) {
            return Ok(CreateCheck::Exists(current));
        }

        let required = round_to_extent(spec.required_capacity_bytes);
        if required > pool.free_capacity_bytes {
            return Err(Error::InsufficientResources {
                pool: spec.pool_name.clone(),
                reason: format!(
                    "requires {} bytes, {} free",
                    required, pool.free_capacity_bytes
                ),
            });
        }
        if pool.free_volume_count <= 0 {
            return Err(Error::InsufficientResources {
                pool: spec.pool_name.clone(),
                reason: "volume count limit reached".to_string(),
            });
        }
        Ok(CreateCheck::Proceed)
    }

    fn check_expand(&self, replica: &LocalVolumeReplica, new_capacity_bytes: i64) -> Result<()> {
        let spec = &replica.spec;
        let pool = self
            .registry
            .pool(&spec.pool_name)
            .ok_or_else(|| Error::not_found("LocalPool", &spec.pool_name))?;
        let current = self
            .registry
            .volume_replica(&spec.volume_name)
            .ok_or_else(|| Error::ReplicaNotFound(spec.volume_name.clone()))?;

        let allocated = current.allocated_bytes();
        if new_capacity_bytes <= allocated {
            return Err(Error::Validation(format!(
                "new capacity {} of {} must exceed allocated {}",
                new_capacity_bytes, spec.volume_name, allocated
            )));
        }
        let delta = round_to_extent(new_capacity_bytes) - allocated;
        if delta > pool.free_capacity_bytes {
            return Err(Error::InsufficientResources {
                pool: spec.pool_name.clone(),
                reason: format!("expansion needs {} bytes, {} free", delta, pool.free_capacity_bytes),
            });
        }
        Ok(())
    }
}
