//! In-process store
//!
//! Keeps objects in a map, assigns resource versions and broadcasts
//! changes to watchers.

use super::{merge_json, Store, StoreObject, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// [`Store`] kept entirely in memory
pub struct MemoryStore<K: StoreObject> {
    objects: RwLock<BTreeMap<String, K>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreObject> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_version(&self, current: &K, incoming: &K) -> Result<()> {
        match incoming.resource_version() {
            Some(rv) if Some(&rv) != current.resource_version().as_ref() => Err(Error::Conflict {
                kind: Self::kind(),
                name: incoming.name_any(),
            }),
            _ => Ok(()),
        }
    }

    /// Store `obj` under a fresh resource version and notify watchers
    fn commit(&self, objects: &mut BTreeMap<String, K>, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.next_version());
        objects.insert(obj.name_any(), obj.clone());
        // no receivers is fine
        let _ = self.events.send(WatchEvent::Applied(obj.clone()));
        obj
    }

    fn with_field(current: &K, incoming: &K, field: &str, keep_incoming: bool) -> Result<K> {
        let mut current_json = serde_json::to_value(current)?;
        let mut incoming_json = serde_json::to_value(incoming)?;
        let (target, source) = if keep_incoming {
            (&mut incoming_json, current_json.get(field).cloned())
        } else {
            (&mut current_json, incoming_json.get(field).cloned())
        };
        if let Some(map) = target.as_object_mut() {
            match source {
                Some(value) => {
                    map.insert(field.to_string(), value);
                }
                None => {
                    map.remove(field);
                }
            }
        }
        let merged = if keep_incoming {
            incoming_json
        } else {
            current_json
        };
        Ok(serde_json::from_value(merged)?)
    }
}

#[async_trait]
impl<K: StoreObject> Store<K> for MemoryStore<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(Self::kind(), name))
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: Self::kind(),
                name,
            });
        }
        let mut obj = obj.clone();
        obj.meta_mut().creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        Ok(self.commit(&mut objects, obj))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let current = objects
            .get(&name)
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        self.check_version(current, obj)?;
        // status is owned by the status subresource
        let updated = Self::with_field(current, obj, "status", true)?;
        Ok(self.commit(&mut objects, updated))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let mut objects = self.objects.write();
        let current = objects
            .get(&name)
            .ok_or_else(|| Error::not_found(Self::kind(), &name))?;
        self.check_version(current, obj)?;
        let updated = Self::with_field(current, obj, "status", false)?;
        Ok(self.commit(&mut objects, updated))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let removed = self.objects.write().remove(name);
        match removed {
            Some(obj) => {
                let _ = self.events.send(WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(Error::not_found(Self::kind(), name)),
        }
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        let mut objects = self.objects.write();
        let current = objects
            .get(name)
            .ok_or_else(|| Error::not_found(Self::kind(), name))?;
        let mut doc = serde_json::to_value(current)?;
        merge_json(&mut doc, patch);
        let patched: K = serde_json::from_value(doc)?;
        Ok(self.commit(&mut objects, patched))
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        // subscribe before the snapshot so nothing falls in between
        let rx = self.events.subscribe();
        let initial = WatchEvent::Restarted(self.objects.read().values().cloned().collect());

        let updates = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Some((
                            Err(Error::Watch(format!("watcher lagged by {} events", missed))),
                            rx,
                        ))
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::once(async move { Ok(initial) }).chain(updates).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalVolumeReplica, LocalVolumeReplicaSpec, LocalVolumeReplicaStatus, State};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn replica(name: &str) -> LocalVolumeReplica {
        LocalVolumeReplica::new(
            name,
            LocalVolumeReplicaSpec {
                volume_name: "pvc-1".into(),
                node_name: "n1".into(),
                required_capacity_bytes: 1 << 30,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let store = MemoryStore::new();
        let created = store.create(&replica("pvc-1-abcdef")).await.unwrap();
        assert!(created.resource_version().is_some());

        assert_matches!(
            store.create(&replica("pvc-1-abcdef")).await,
            Err(Error::ResourceExists { .. })
        );

        store.delete("pvc-1-abcdef").await.unwrap();
        let err = store.get("pvc-1-abcdef").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.delete("pvc-1-abcdef").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_and_status_are_separate() {
        let store = MemoryStore::new();
        let mut obj = store.create(&replica("r1")).await.unwrap();

        obj.status = Some(LocalVolumeReplicaStatus {
            state: State::Creating,
            ..Default::default()
        });
        let obj = store.update_status(&obj).await.unwrap();
        assert_eq!(obj.state(), State::Creating);

        // spec update must not clobber status
        let mut spec_change = obj.clone();
        spec_change.spec.required_capacity_bytes = 2 << 30;
        spec_change.status = None;
        let updated = store.update(&spec_change).await.unwrap();
        assert_eq!(updated.spec.required_capacity_bytes, 2 << 30);
        assert_eq!(updated.state(), State::Creating);
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let stale = store.create(&replica("r1")).await.unwrap();
        let mut fresh = stale.clone();
        fresh.spec.delete = true;
        store.update(&fresh).await.unwrap();

        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_patch_merges() {
        let store = MemoryStore::new();
        store.create(&replica("r1")).await.unwrap();
        let patched = store
            .patch("r1", &json!({"spec": {"delete": true}}))
            .await
            .unwrap();
        assert!(patched.spec.delete);
        assert_eq!(patched.spec.volume_name, "pvc-1");
    }

    #[tokio::test]
    async fn test_watch_relists_then_streams() {
        let store = MemoryStore::new();
        store.create(&replica("r1")).await.unwrap();

        let mut events = store.watch();
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Restarted(objs))) if objs.len() == 1);

        store.create(&replica("r2")).await.unwrap();
        store.delete("r1").await.unwrap();
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Applied(obj))) if obj.name_any() == "r2");
        assert_matches!(events.next().await, Some(Ok(WatchEvent::Deleted(obj))) if obj.name_any() == "r1");
    }
}
