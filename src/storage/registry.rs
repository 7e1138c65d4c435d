//! Node-local registry of pools, disks and volume replicas
//!
//! The registry is the authoritative in-memory model of what this node
//! stores. Every admitted change is published to the node's
//! `LocalStorageNode` status.

use super::lvm::LvmExecutor;
use crate::crd::{
    node_conditions, set_condition, Condition, LocalDevice, LocalDiskClaimSpec, LocalPool,
    LocalStorageNode, LocalVolumeReplica, State,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{get_optional, SharedStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Attempts at publishing before giving up on repeated conflicts
const PUBLISH_ATTEMPTS: usize = 3;

#[derive(Debug, Default)]
struct Tables {
    pools: BTreeMap<String, LocalPool>,
    disks: BTreeMap<String, LocalDevice>,
    /// Keyed by volume name
    replicas: BTreeMap<String, LocalVolumeReplica>,
}

pub struct LocalRegistry {
    node_name: String,
    lvm: Arc<LvmExecutor>,
    nodes: SharedStore<LocalStorageNode>,
    tables: RwLock<Tables>,
    /// Serialises mutation together with publishing
    publish: Mutex<()>,
}

impl LocalRegistry {
    pub fn new(
        node_name: impl Into<String>,
        lvm: Arc<LvmExecutor>,
        nodes: SharedStore<LocalStorageNode>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            lvm,
            nodes,
            tables: RwLock::new(Tables::default()),
            publish: Mutex::new(()),
        }
    }

    pub async fn init(&self) {
        if let Err(e) = self.sync_node_resources().await {
            error!(node = %self.node_name, error = %e, "Failed to initialise local registry");
        }
    }

    /// Rebuild every table from the host and publish the result
    pub async fn sync_node_resources(&self) -> Result<()> {
        let _guard = self.publish.lock().await;
        debug!(node = %self.node_name, "Rebuilding node resources");

        let pools = self.lvm.get_pools().await?;
        let replicas = self.lvm.get_replicas().await?;
        {
            let mut tables = self.tables.write();
            tables.disks = pools
                .values()
                .flat_map(|pool| pool.disks.iter())
                .map(|disk| (disk.dev_path.clone(), disk.clone()))
                .collect();
            tables.pools = pools;
            tables.replicas = replicas;
        }

        self.sync_to_node().await
    }

    /// Account for a replica after its state changed
    pub async fn update_node_for_volume_replica(&self, replica: &LocalVolumeReplica) {
        let result = match replica.state() {
            State::Ready | State::NotReady => self.register_volume_replica(replica).await,
            State::Deleted => self.deregister_volume_replica(replica).await,
            _ => return,
        };
        if let Err(e) = result {
            error!(
                replica = %replica.metadata.name.as_deref().unwrap_or_default(),
                state = %replica.state(),
                error = %e,
                "Failed to update node for volume replica"
            );
        }
    }

    pub(crate) async fn register_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let _guard = self.publish.lock().await;
        let volume = &replica.spec.volume_name;
        let allocated = replica.allocated_bytes();
        {
            let mut guard = self.tables.write();
            let tables = &mut *guard;
            let previous = tables.replicas.get(volume).map(|r| r.allocated_bytes());
            if previous == Some(allocated) {
                debug!(volume = %volume, "Replica size unchanged, skipping registration");
                return Ok(());
            }
            let pool = tables
                .pools
                .get_mut(&replica.spec.pool_name)
                .ok_or_else(|| Error::not_found("LocalPool", &replica.spec.pool_name))?;

            if let Some(old) = previous {
                pool.free_capacity_bytes += old;
                pool.used_capacity_bytes -= old;
                pool.free_volume_count += 1;
                pool.used_volume_count -= 1;
            }
            pool.free_capacity_bytes -= allocated;
            pool.used_capacity_bytes += allocated;
            pool.free_volume_count -= 1;
            pool.used_volume_count += 1;
            if !pool.volumes.contains(volume) {
                pool.volumes.push(volume.clone());
            }
            tables.replicas.insert(volume.clone(), replica.clone());
        }
        debug!(volume = %volume, pool = %replica.spec.pool_name, allocated, "Registered volume replica");

        self.sync_to_node().await
    }

    pub(crate) async fn deregister_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
    ) -> Result<()> {
        let _guard = self.publish.lock().await;
        let volume = &replica.spec.volume_name;
        {
            let mut guard = self.tables.write();
            let tables = &mut *guard;
            if tables.replicas.remove(volume).is_none() {
                info!(volume = %volume, "Skipping deregistration of unregistered replica");
                return Ok(());
            }
            if let Some(pool) = tables.pools.get_mut(&replica.spec.pool_name) {
                let allocated = replica.allocated_bytes();
                pool.free_capacity_bytes += allocated;
                pool.used_capacity_bytes -= allocated;
                pool.free_volume_count += 1;
                pool.used_volume_count -= 1;
                pool.volumes.retain(|v| v != volume);
            }
        }
        debug!(volume = %volume, "Deregistered volume replica");

        self.sync_to_node().await
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn pools(&self) -> BTreeMap<String, LocalPool> {
        self.tables.read().pools.clone()
    }

    pub fn pool(&self, name: &str) -> Option<LocalPool> {
        self.tables.read().pools.get(name).cloned()
    }

    pub fn disks(&self) -> BTreeMap<String, LocalDevice> {
        self.tables.read().disks.clone()
    }

    pub fn volume_replicas(&self) -> BTreeMap<String, LocalVolumeReplica> {
        self.tables.read().replicas.clone()
    }

    pub fn volume_replica(&self, volume: &str) -> Option<LocalVolumeReplica> {
        self.tables.read().replicas.get(volume).cloned()
    }

    pub fn has_volume_replica(&self, replica: &LocalVolumeReplica) -> bool {
        self.tables
            .read()
            .replicas
            .contains_key(&replica.spec.volume_name)
    }

    // -------------------------------------------------------------------------
    // Node Status
    // -------------------------------------------------------------------------

    /// Record a node condition; one condition is kept per type
    pub async fn update_condition(&self, condition: Condition) -> Result<()> {
        match condition.r#type.as_str() {
            node_conditions::EXPAND_FAILURE | node_conditions::UNAVAILABLE => warn!(
                node = %self.node_name,
                condition = %condition.r#type,
                message = %condition.message,
                "Storage node condition"
            ),
            _ => info!(
                node = %self.node_name,
                condition = %condition.r#type,
                message = %condition.message,
                "Storage node condition"
            ),
        }

        let Some(mut node) = get_optional(self.nodes.as_ref(), &self.node_name).await? else {
            warn!(node = %self.node_name, "LocalStorageNode not found, dropping condition");
            return Ok(());
        };
        set_condition(&mut node.status_mut().conditions, condition);
        self.nodes.update_status(&node).await?;
        Ok(())
    }

    /// Remember which disk claim extended `pool`
    pub async fn update_pool_extend_record(
        &self,
        pool: &str,
        record: LocalDiskClaimSpec,
    ) -> Result<()> {
        let Some(mut node) = get_optional(self.nodes.as_ref(), &self.node_name).await? else {
            warn!(node = %self.node_name, "LocalStorageNode not found, dropping extend record");
            return Ok(());
        };
        let records = node
            .status_mut()
            .pool_extend_records
            .entry(pool.to_string())
            .or_default();
        if records.contains(&record) {
            return Ok(());
        }
        records.push(record);
        self.nodes.update_status(&node).await?;
        Ok(())
    }

    /// Publish pools to the node status; a missing node is not an error
    async fn sync_to_node(&self) -> Result<()> {
        let pools = self.pools();
        for pool in pools.values() {
            metrics::set_pool_free_bytes(&pool.name, pool.free_capacity_bytes);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(mut node) = get_optional(self.nodes.as_ref(), &self.node_name).await? else {
                warn!(node = %self.node_name, "LocalStorageNode not found, skipping sync");
                return Ok(());
            };
            let status = node.status_mut();
            if status.state == State::Ready && status.pools == pools {
                return Ok(());
            }
            status.state = State::Ready;
            status.pools = pools.clone();

            match self.nodes.update_status(&node).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < PUBLISH_ATTEMPTS => {
                    debug!(node = %self.node_name, attempt, "Conflict publishing node status, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, LocalStorageNodeSpec, LocalVolumeReplicaSpec};
    use crate::storage::lvm::tests::scripted;
    use crate::store::{MemoryStore, Store};

    pub(crate) async fn registry_with_node() -> (Arc<LocalRegistry>, SharedStore<LocalStorageNode>) {
        let nodes: SharedStore<LocalStorageNode> = Arc::new(MemoryStore::new());
        nodes
            .create(&LocalStorageNode::new(
                "n1",
                LocalStorageNodeSpec {
                    hostname: "n1".into(),
                    storage_ip: "10.0.0.1".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        let lvm = Arc::new(LvmExecutor::new(scripted()));
        let registry = Arc::new(LocalRegistry::new("n1", lvm, nodes.clone()));
        registry.sync_node_resources().await.unwrap();
        (registry, nodes)
    }

    fn replica(volume: &str, allocated: i64, state: State) -> LocalVolumeReplica {
        let mut r = LocalVolumeReplica::new(
            &format!("{}-abcdef", volume),
            LocalVolumeReplicaSpec {
                volume_name: volume.into(),
                pool_name: "LocalStorage_PoolHDD".into(),
                node_name: "n1".into(),
                required_capacity_bytes: allocated,
                ..Default::default()
            },
        );
        r.status_mut().allocated_capacity_bytes = allocated;
        r.status_mut().state = state;
        r
    }

    #[tokio::test]
    async fn test_sync_publishes_pools() {
        let (registry, nodes) = registry_with_node().await;
        assert!(registry.has_volume_replica(&replica("pvc-1", 1 << 30, State::Ready)));
        assert!(registry.disks().contains_key("/dev/sdb"));

        let node = nodes.get("n1").await.unwrap();
        let status = node.status.unwrap();
        assert_eq!(status.state, State::Ready);
        assert!(status.pools.contains_key("LocalStorage_PoolHDD"));

        // unchanged pools are not written again
        let version = node.metadata.resource_version.clone();
        registry.sync_node_resources().await.unwrap();
        assert_eq!(nodes.get("n1").await.unwrap().metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_register_and_deregister_keep_accounting() {
        let (registry, nodes) = registry_with_node().await;
        let before = registry.pool("LocalStorage_PoolHDD").unwrap();

        registry
            .update_node_for_volume_replica(&replica("pvc-2", 1 << 30, State::Ready))
            .await;
        let after = registry.pool("LocalStorage_PoolHDD").unwrap();
        assert_eq!(after.used_capacity_bytes, before.used_capacity_bytes + (1 << 30));
        assert_eq!(after.free_volume_count, before.free_volume_count - 1);
        assert_eq!(
            after.used_capacity_bytes + after.free_capacity_bytes,
            after.total_capacity_bytes
        );
        assert!(after.volumes.contains(&"pvc-2".to_string()));

        // growth re-accounts without a second volume slot
        registry
            .update_node_for_volume_replica(&replica("pvc-2", 2 << 30, State::NotReady))
            .await;
        let grown = registry.pool("LocalStorage_PoolHDD").unwrap();
        assert_eq!(grown.used_capacity_bytes, before.used_capacity_bytes + (2 << 30));
        assert_eq!(grown.used_volume_count, after.used_volume_count);

        registry
            .update_node_for_volume_replica(&replica("pvc-2", 2 << 30, State::Deleted))
            .await;
        let back = registry.pool("LocalStorage_PoolHDD").unwrap();
        assert_eq!(back, before);

        let published = nodes.get("n1").await.unwrap().status.unwrap();
        assert_eq!(published.pools["LocalStorage_PoolHDD"], before);
    }

    #[tokio::test]
    async fn test_deregister_unknown_is_noop() {
        let (registry, _) = registry_with_node().await;
        let before = registry.pools();
        registry
            .deregister_volume_replica(&replica("pvc-404", 1 << 30, State::Deleted))
            .await
            .unwrap();
        assert_eq!(registry.pools(), before);
    }

    #[tokio::test]
    async fn test_conditions_and_extend_records() {
        let (registry, nodes) = registry_with_node().await;
        registry
            .update_condition(Condition::new(
                node_conditions::EXPAND_FAILURE,
                ConditionStatus::True,
                "ExtendFailed",
                "vgextend failed",
            ))
            .await
            .unwrap();
        registry
            .update_condition(Condition::new(
                node_conditions::EXPAND_FAILURE,
                ConditionStatus::False,
                "Extended",
                "",
            ))
            .await
            .unwrap();

        let record = LocalDiskClaimSpec {
            node_name: "n1".into(),
            ..Default::default()
        };
        for _ in 0..2 {
            registry
                .update_pool_extend_record("LocalStorage_PoolHDD", record.clone())
                .await
                .unwrap();
        }

        let status = nodes.get("n1").await.unwrap().status.unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::False);
        assert_eq!(status.pool_extend_records["LocalStorage_PoolHDD"].len(), 1);
    }
}
