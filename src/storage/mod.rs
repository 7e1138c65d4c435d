//! Local storage: LVM pools, replicas, snapshots and the node registry

pub mod dd;
pub mod lvm;
pub mod pools;
pub mod registry;
pub mod replica;
pub mod snapshot;

pub use dd::{pool_volume_path, DdExecutor};
pub use lvm::{Inconsistency, LvmExecutor};
pub use pools::*;
pub use registry::LocalRegistry;
pub use replica::VolumeReplicaManager;
pub use snapshot::SnapshotManager;

use crate::config::NodeConfig;
use crate::crd::LocalVolumeReplica;
use crate::exec::CommandExecutor;
use crate::store::Stores;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Entry point to everything stored on this node
pub struct LocalManager {
    /// Completed with the storage IP during registration
    node_config: RwLock<NodeConfig>,
    lvm: Arc<LvmExecutor>,
    registry: Arc<LocalRegistry>,
    volume_replica_manager: VolumeReplicaManager,
    snapshot_manager: SnapshotManager,
}

impl LocalManager {
    pub fn new(
        node_config: NodeConfig,
        exec: Arc<dyn CommandExecutor>,
        stores: &Stores,
        restore_timeout: Duration,
    ) -> Self {
        let lvm = Arc::new(LvmExecutor::new(exec.clone()));
        let registry = Arc::new(LocalRegistry::new(
            &node_config.name,
            lvm.clone(),
            stores.storage_nodes.clone(),
        ));
        let volume_replica_manager = VolumeReplicaManager::new(
            &node_config.name,
            lvm.clone(),
            registry.clone(),
            stores.replicas.clone(),
        );
        let snapshot_manager = SnapshotManager::new(
            lvm.clone(),
            DdExecutor::new(exec).with_timeout(restore_timeout),
            registry.clone(),
        );
        Self {
            node_config: RwLock::new(node_config),
            lvm,
            registry,
            volume_replica_manager,
            snapshot_manager,
        }
    }

    /// Check the host against declared replicas, then load the registry
    pub async fn register(&self) {
        self.volume_replica_manager.consistency_check().await;
        self.registry.init().await;
    }

    pub async fn update_node_for_volume_replica(&self, replica: &LocalVolumeReplica) {
        self.registry.update_node_for_volume_replica(replica).await;
    }

    pub fn registry(&self) -> &Arc<LocalRegistry> {
        &self.registry
    }

    /// Pool operations are served directly by LVM
    pub fn pool_manager(&self) -> &LvmExecutor {
        &self.lvm
    }

    pub fn volume_replica_manager(&self) -> &VolumeReplicaManager {
        &self.volume_replica_manager
    }

    pub fn snapshot_manager(&self) -> &SnapshotManager {
        &self.snapshot_manager
    }

    pub fn node_config(&self) -> NodeConfig {
        self.node_config.read().clone()
    }

    pub fn set_node_config(&self, node_config: NodeConfig) {
        *self.node_config.write() = node_config;
    }
}
