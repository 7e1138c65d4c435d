//! Declarative object store
//!
//! Every worker reads and writes cluster objects through the [`Store`] trait.
//! [`KubeStore`] talks to the API server; [`MemoryStore`] keeps objects in
//! process for standalone runs and tests.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{
    LocalDisk, LocalDiskClaim, LocalStorageNode, LocalVolume, LocalVolumeReplica,
    LocalVolumeReplicaSnapshot, LocalVolumeReplicaSnapshotRestore, LocalVolumeSnapshot,
};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;

// =============================================================================
// Store Trait
// =============================================================================

/// Bounds every stored object satisfies
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Change notification delivered by [`Store::watch`]
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object was created or modified
    Applied(K),
    /// Object was removed; carries its last known state
    Deleted(K),
    /// Full relist, sent when the watch (re)starts
    Restarted(Vec<K>),
}

/// Access to one kind of cluster object
///
/// Writes use optimistic concurrency: `update` and `update_status` fail with
/// a conflict when the object's resource version is stale.
#[async_trait]
pub trait Store<K: StoreObject>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K>;

    async fn list(&self) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace spec and metadata
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Delete by name; a missing object is reported as not found
    async fn delete(&self, name: &str) -> Result<()>;

    /// JSON merge patch against the stored object
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<K>;

    /// Stream of changes, starting with a full relist
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

pub type SharedStore<K> = Arc<dyn Store<K>>;

/// Look up an object, mapping not-found to `None`
pub async fn get_optional<K: StoreObject>(store: &dyn Store<K>, name: &str) -> Result<Option<K>> {
    match store.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Store Bundle
// =============================================================================

/// One store per kind the node agent consumes
#[derive(Clone)]
pub struct Stores {
    pub volumes: SharedStore<LocalVolume>,
    pub replicas: SharedStore<LocalVolumeReplica>,
    pub volume_snapshots: SharedStore<LocalVolumeSnapshot>,
    pub replica_snapshots: SharedStore<LocalVolumeReplicaSnapshot>,
    pub snapshot_restores: SharedStore<LocalVolumeReplicaSnapshotRestore>,
    pub disk_claims: SharedStore<LocalDiskClaim>,
    pub disks: SharedStore<LocalDisk>,
    pub storage_nodes: SharedStore<LocalStorageNode>,
    pub nodes: SharedStore<Node>,
    pub config_maps: SharedStore<ConfigMap>,
}

impl Stores {
    /// Stores backed by the API server; config maps are read from `namespace`
    pub fn kube(client: kube::Client, namespace: &str) -> Self {
        Self {
            volumes: Arc::new(KubeStore::all(client.clone())),
            replicas: Arc::new(KubeStore::all(client.clone())),
            volume_snapshots: Arc::new(KubeStore::all(client.clone())),
            replica_snapshots: Arc::new(KubeStore::all(client.clone())),
            snapshot_restores: Arc::new(KubeStore::all(client.clone())),
            disk_claims: Arc::new(KubeStore::all(client.clone())),
            disks: Arc::new(KubeStore::all(client.clone())),
            storage_nodes: Arc::new(KubeStore::all(client.clone())),
            nodes: Arc::new(KubeStore::all(client.clone())),
            config_maps: Arc::new(KubeStore::namespaced(client, namespace)),
        }
    }

    /// In-process stores
    pub fn memory() -> Self {
        Self {
            volumes: Arc::new(MemoryStore::new()),
            replicas: Arc::new(MemoryStore::new()),
            volume_snapshots: Arc::new(MemoryStore::new()),
            replica_snapshots: Arc::new(MemoryStore::new()),
            snapshot_restores: Arc::new(MemoryStore::new()),
            disk_claims: Arc::new(MemoryStore::new()),
            disks: Arc::new(MemoryStore::new()),
            storage_nodes: Arc::new(MemoryStore::new()),
            nodes: Arc::new(MemoryStore::new()),
            config_maps: Arc::new(MemoryStore::new()),
        }
    }
}

/// Apply an RFC 7396 JSON merge patch in place
pub(crate) fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;

    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(map) = target {
                for (key, value) in fields {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_json(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
