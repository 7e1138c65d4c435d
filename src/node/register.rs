//! Node registration
//!
//! Resolves the node's storage address and topology from its Kubernetes
//! `Node`, makes sure a `LocalStorageNode` exists for it, then hands over
//! to the local storage manager.

use super::manager::NodeManager;
use crate::config::NodeConfig;
use crate::crd::{LocalStorageNode, LocalStorageNodeSpec, Topology};
use crate::error::{Error, Result};
use crate::store::get_optional;
use k8s_openapi::api::core::v1::Node;
use std::net::Ipv4Addr;
use tracing::{info, warn};

const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const REGION_LABEL: &str = "topology.kubernetes.io/region";
const INTERNAL_IP: &str = "InternalIP";

/// Storage IPv4 of `node`: the annotation when set, else the first internal address
pub fn storage_ipv4_address(node: &Node, annotation: Option<&str>) -> Result<String> {
    if let Some(value) = annotation
        .and_then(|key| node.metadata.annotations.as_ref()?.get(key))
        .filter(|v| !v.is_empty())
    {
        return value
            .parse::<Ipv4Addr>()
            .map(|ip| ip.to_string())
            .map_err(|_| Error::Configuration(format!("invalid storage IPv4 address {:?}", value)));
    }

    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .into_iter()
        .flatten()
        .filter(|a| a.type_ == INTERNAL_IP)
        .find_map(|a| a.address.parse::<Ipv4Addr>().ok())
        .map(|ip| ip.to_string())
        .ok_or_else(|| Error::Configuration("not found valid IPv4 address".into()))
}

/// Zone and region from the well-known topology labels
pub fn node_topology(node: &Node) -> Topology {
    let label = |key: &str| {
        node.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .cloned()
            .unwrap_or_default()
    };
    Topology {
        zone: label(ZONE_LABEL),
        region: label(REGION_LABEL),
    }
}

impl NodeManager {
    pub(super) async fn register(&self) -> Result<()> {
        info!(node = %self.name, "Registering node");
        let node = self.stores.nodes.get(&self.name).await?;

        let storage_node = match get_optional(self.stores.storage_nodes.as_ref(), &self.name).await? {
            Some(existing) => self.backfill_storage_node(existing, &node).await?,
            None => {
                let spec = LocalStorageNodeSpec {
                    hostname: self.name.clone(),
                    storage_ip: storage_ipv4_address(
                        &node,
                        self.options.storage_ip_annotation.as_deref(),
                    )?,
                    topology: node_topology(&node),
                };
                info!(node = %self.name, storage_ip = %spec.storage_ip, "Creating LocalStorageNode");
                self.stores
                    .storage_nodes
                    .create(&LocalStorageNode::new(&self.name, spec))
                    .await?
            }
        };

        self.storage.set_node_config(NodeConfig {
            name: self.name.clone(),
            storage_ip: storage_node.spec.storage_ip.clone(),
            topology: storage_node.spec.topology.clone(),
        });
        self.storage.register().await;
        info!(node = %self.name, "Node registered");
        Ok(())
    }

    /// Nodes created by older releases carry no storage IP
    async fn backfill_storage_node(
        &self,
        mut storage_node: LocalStorageNode,
        node: &Node,
    ) -> Result<LocalStorageNode> {
        if !storage_node.spec.storage_ip.is_empty() {
            return Ok(storage_node);
        }
        let storage_ip =
            storage_ipv4_address(node, self.options.storage_ip_annotation.as_deref())?;
        warn!(node = %self.name, storage_ip = %storage_ip, "LocalStorageNode has no storage IP, backfilling");
        storage_node.spec.storage_ip = storage_ip;
        self.stores.storage_nodes.update(&storage_node).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::manager::tests::harness;
    use crate::store::Store;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    pub(crate) fn k8s_node(name: &str, ip: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(BTreeMap::from([(ZONE_LABEL.to_string(), "zone-a".to_string())])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "Hostname".into(),
                        address: name.into(),
                    },
                    NodeAddress {
                        type_: INTERNAL_IP.into(),
                        address: ip.into(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_storage_ip_resolution() {
        let mut node = k8s_node("n2", "10.6.1.2");
        assert_eq!(storage_ipv4_address(&node, None).unwrap(), "10.6.1.2");

        let key = "hwameistor.io/storage-ipv4";
        node.metadata.annotations = Some(BTreeMap::from([(key.to_string(), "192.168.1.9".to_string())]));
        assert_eq!(storage_ipv4_address(&node, Some(key)).unwrap(), "192.168.1.9");

        node.metadata.annotations = Some(BTreeMap::from([(key.to_string(), "fe80::1".to_string())]));
        assert_matches!(storage_ipv4_address(&node, Some(key)), Err(Error::Configuration(_)));

        let bare = k8s_node("n3", "fe80::2");
        assert_matches!(
            storage_ipv4_address(&bare, None),
            Err(Error::Configuration(m)) if m == "not found valid IPv4 address"
        );
    }

    #[test]
    fn test_topology_from_labels() {
        let topology = node_topology(&k8s_node("n2", "10.6.1.2"));
        assert_eq!(topology.zone, "zone-a");
        assert!(topology.region.is_empty());
    }

    #[tokio::test]
    async fn test_register_backfills_storage_ip() {
        let h = harness().await;
        h.stores.nodes.create(&k8s_node("n1", "10.6.1.1")).await.unwrap();
        let mut existing = h.stores.storage_nodes.get("n1").await.unwrap();
        existing.spec.storage_ip.clear();
        h.stores.storage_nodes.update(&existing).await.unwrap();

        h.manager.register().await.unwrap();

        let storage_node = h.stores.storage_nodes.get("n1").await.unwrap();
        assert_eq!(storage_node.spec.storage_ip, "10.6.1.1");
        assert_eq!(h.manager.storage().node_config().storage_ip, "10.6.1.1");
    }

    #[tokio::test]
    async fn test_register_creates_storage_node() {
        let h = harness().await;
        h.stores.nodes.create(&k8s_node("n1", "10.6.1.1")).await.unwrap();
        h.stores.storage_nodes.delete("n1").await.unwrap();

        h.manager.register().await.unwrap();

        let storage_node = h.stores.storage_nodes.get("n1").await.unwrap();
        assert_eq!(storage_node.spec.hostname, "n1");
        assert_eq!(storage_node.spec.storage_ip, "10.6.1.1");
        assert_eq!(storage_node.spec.topology.zone, "zone-a");
        // the registry publishes pools once loaded
        assert!(storage_node.status.unwrap().pools.contains_key("LocalStorage_PoolHDD"));
    }

    #[tokio::test]
    async fn test_register_requires_kubernetes_node() {
        let h = harness().await;
        assert!(h.manager.register().await.unwrap_err().is_not_found());
    }
}
