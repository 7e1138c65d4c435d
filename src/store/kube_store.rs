//! API-server backed store

use super::{Store, StoreObject, WatchEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};

/// [`Store`] over a typed kube [`Api`]
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K: StoreObject> KubeStore<K> {
    /// Cluster-wide access
    pub fn all(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    fn kind() -> String {
        K::kind(&()).to_string()
    }

    fn map_err(err: kube::Error, name: &str) -> Error {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::not_found(Self::kind(), name),
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: Self::kind(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }
}

impl<K> KubeStore<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    /// Access limited to one namespace
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<K: StoreObject> Store<K> for KubeStore<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.api.get(name).await.map_err(|e| Self::map_err(e, name))
    }

    async fn list(&self) -> Result<Vec<K>> {
        let list = self
            .api
            .list(&Default::default())
            .await
            .map_err(|e| Self::map_err(e, ""))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| match &e {
                kube::Error::Api(resp) if resp.code == 409 => Error::ResourceExists {
                    kind: Self::kind(),
                    name: name.clone(),
                },
                _ => Self::map_err(e, &name),
            })
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(e, &name))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let body = serde_json::to_vec(obj)?;
        self.api
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Self::map_err(e, &name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_err(e, name))?;
        Ok(())
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> Result<K> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Self::map_err(e, name))
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<K>>> {
        watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .map_ok(|event| match event {
                watcher::Event::Applied(obj) => WatchEvent::Applied(obj),
                watcher::Event::Deleted(obj) => WatchEvent::Deleted(obj),
                watcher::Event::Restarted(objs) => WatchEvent::Restarted(objs),
            })
            .map_err(|e| Error::Watch(e.to_string()))
            .boxed()
    }
}
