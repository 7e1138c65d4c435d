//! Watches feeding the node's task queues
//!
//! One task per watched kind. A relist is replayed as a burst of applied
//! events; a watch that fails or ends stops the node manager.

use super::data_copy_worker;
use super::keys;
use super::manager::NodeManager;
use crate::crd::{
    LocalDisk, LocalDiskClaim, LocalStorageNode, LocalVolume, LocalVolumeReplica,
    LocalVolumeReplicaSnapshot, LocalVolumeReplicaSnapshotRestore, LocalVolumeSnapshot, State,
};
use crate::error::{Error, Result};
use crate::store::{SharedStore, StoreObject, WatchEvent};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A single object change, with relists already flattened
#[derive(Debug)]
pub(super) enum Change<K> {
    Applied(K),
    Deleted(K),
}

/// Copy of `obj` that can be created again under the same name
fn recreatable<K: StoreObject>(obj: &K) -> K {
    let mut obj = obj.clone();
    let meta = obj.meta_mut();
    meta.resource_version = None;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.managed_fields = None;
    obj
}

impl NodeManager {
    pub(super) fn spawn_informers(
        self: &Arc<Self>,
        informers: &mut JoinSet<Result<()>>,
        stop: &CancellationToken,
    ) {
        self.spawn_informer(informers, stop, self.stores.storage_nodes.clone(), |m, c| async move {
            m.on_storage_node(c).await
        });
        self.spawn_informer(informers, stop, self.stores.volumes.clone(), |m, c| async move {
            m.on_volume(c)
        });
        self.spawn_informer(informers, stop, self.stores.replicas.clone(), |m, c| async move {
            m.on_volume_replica(c).await
        });
        self.spawn_informer(informers, stop, self.stores.volume_snapshots.clone(), |m, c| async move {
            m.on_volume_snapshot(c)
        });
        self.spawn_informer(informers, stop, self.stores.replica_snapshots.clone(), |m, c| async move {
            m.on_replica_snapshot(c)
        });
        self.spawn_informer(informers, stop, self.stores.snapshot_restores.clone(), |m, c| async move {
            m.on_snapshot_restore(c)
        });
        self.spawn_informer(informers, stop, self.stores.disk_claims.clone(), |m, c| async move {
            m.on_disk_claim(c)
        });
        self.spawn_informer(informers, stop, self.stores.disks.clone(), |m, c| async move {
            m.on_disk(c)
        });
        self.spawn_informer(informers, stop, self.stores.config_maps.clone(), |m, c| async move {
            m.on_config_map(c).await
        });
    }

    fn spawn_informer<K, F, Fut>(
        self: &Arc<Self>,
        informers: &mut JoinSet<Result<()>>,
        stop: &CancellationToken,
        store: SharedStore<K>,
        handle: F,
    ) where
        K: StoreObject,
        F: Fn(Arc<Self>, Change<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let this = Arc::clone(self);
        let stop = stop.clone();
        let kind = K::kind(&()).to_string();

        informers.spawn(async move {
            let mut events = store.watch();
            debug!(kind = %kind, "Informer started");
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => return Ok(()),
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(WatchEvent::Restarted(objects))) => {
                        debug!(kind = %kind, count = objects.len(), "Informer relisted");
                        for obj in objects {
                            handle(this.clone(), Change::Applied(obj)).await;
                        }
                    }
                    Some(Ok(WatchEvent::Applied(obj))) => handle(this.clone(), Change::Applied(obj)).await,
                    Some(Ok(WatchEvent::Deleted(obj))) => handle(this.clone(), Change::Deleted(obj)).await,
                    Some(Err(e)) => {
                        error!(kind = %kind, error = %e, "Watch failed");
                        return Err(e);
                    }
                    None => return Err(Error::Watch(format!("{} watch ended", kind))),
                }
            }
        });
    }

    /// Put this node's `LocalStorageNode` back if someone deletes it
    async fn on_storage_node(&self, change: Change<LocalStorageNode>) {
        let Change::Deleted(node) = change else {
            return;
        };
        if node.name_any() != self.name {
            return;
        }
        warn!(node = %self.name, "LocalStorageNode deleted, rebuilding it");
        if let Err(e) = self.rebuild_storage_node(&node).await {
            error!(node = %self.name, error = %e, "Failed to rebuild LocalStorageNode");
        }
    }

    async fn rebuild_storage_node(&self, node: &LocalStorageNode) -> Result<()> {
        let mut created = self.stores.storage_nodes.create(&recreatable(node)).await?;
        created.status = node.status.clone();
        self.stores.storage_nodes.update_status(&created).await?;
        self.storage.registry().sync_node_resources().await
    }

    fn on_volume(&self, change: Change<LocalVolume>) {
        if let Change::Applied(volume) = change {
            self.queues.volume.add(volume.name_any());
        }
    }

    async fn on_volume_replica(&self, change: Change<LocalVolumeReplica>) {
        match change {
            Change::Applied(replica) => {
                if replica.spec.node_name != self.name {
                    return;
                }
                self.storage.update_node_for_volume_replica(&replica).await;
                self.queues.replica.add(replica.name_any());
            }
            Change::Deleted(replica) => {
                if replica.spec.node_name != self.name {
                    return;
                }
                if replica.state() != State::Deleted {
                    self.rebuild_volume_replica(&replica).await;
                    return;
                }
                self.records
                    .lock()
                    .await
                    .replicas
                    .remove(&replica.spec.volume_name);
                self.storage.update_node_for_volume_replica(&replica).await;
            }
        }
    }

    /// A replica removed before reaching `Deleted` still holds data on this host
    async fn rebuild_volume_replica(&self, replica: &LocalVolumeReplica) {
        let name = replica.name_any();
        warn!(replica = %name, state = %replica.state(), "Volume replica deleted unexpectedly, rebuilding it");
        let result: Result<LocalVolumeReplica> = async {
            let mut created = self.stores.replicas.create(&recreatable(replica)).await?;
            created.status = replica.status.clone();
            self.stores.replicas.update_status(&created).await
        }
        .await;
        if let Err(e) = result {
            error!(replica = %name, error = %e, "Failed to rebuild volume replica");
        }
    }

    fn on_volume_snapshot(&self, change: Change<LocalVolumeSnapshot>) {
        if let Change::Applied(snapshot) = change {
            self.queues.volume_snapshot.add(snapshot.name_any());
        }
    }

    fn on_replica_snapshot(&self, change: Change<LocalVolumeReplicaSnapshot>) {
        if let Change::Applied(snapshot) = change {
            if snapshot.spec.node_name == self.name {
                self.queues.replica_snapshot.add(snapshot.name_any());
            }
        }
    }

    fn on_snapshot_restore(&self, change: Change<LocalVolumeReplicaSnapshotRestore>) {
        if let Change::Applied(restore) = change {
            if restore.spec.node_name == self.name {
                self.queues.snapshot_restore.add(restore.name_any());
            }
        }
    }

    fn on_disk_claim(&self, change: Change<LocalDiskClaim>) {
        if let Change::Applied(claim) = change {
            if claim.spec.node_name == self.name {
                self.queues.disk_claim.add(claim.name_any());
            }
        }
    }

    fn on_disk(&self, change: Change<LocalDisk>) {
        if let Change::Applied(disk) = change {
            if disk.spec.node_name == self.name {
                self.queues.disk.add(disk.name_any());
            }
        }
    }

    /// Route per-volume sync configs to the data-copy queue and keep the
    /// data-copy public key in `authorized_keys` in step with its config map
    async fn on_config_map(&self, change: Change<ConfigMap>) {
        let system = &self.options.system;
        let (config_map, deleted) = match change {
            Change::Applied(cm) => (cm, false),
            Change::Deleted(cm) => (cm, true),
        };
        let name = config_map.name_any();
        if name.starts_with(&format!("{}-", system.data_copy_sync_config_map_prefix)) {
            let volume = config_map
                .data
                .as_ref()
                .and_then(|d| d.get(data_copy_worker::LOCAL_VOLUME))
                .cloned()
                .unwrap_or_default();
            if volume.is_empty() {
                debug!(config_map = %name, "Sync config names no volume");
            } else if deleted {
                self.queues.data_copy.forget(&volume);
            } else {
                self.queues.data_copy.add(volume);
            }
            return;
        }
        if name != system.data_copy_key_config_map {
            return;
        }
        let key = config_map
            .data
            .as_ref()
            .and_then(|d| d.get(&system.data_copy_key_field))
            .cloned()
            .unwrap_or_default();
        if key.trim().is_empty() {
            debug!(config_map = %system.data_copy_key_config_map, "No data-copy key published");
            return;
        }

        let path = &system.authorized_keys_path;
        let result = if deleted {
            keys::remove_public_key(path, &key).await
        } else {
            keys::add_public_key(path, &key).await
        };
        match result {
            Ok(true) => info!(file = %path.display(), removed = deleted, "Data-copy key updated"),
            Ok(false) => {}
            Err(e) => error!(file = %path.display(), error = %e, "Failed to update data-copy key"),
        }
    }
}
