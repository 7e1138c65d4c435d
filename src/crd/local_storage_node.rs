//! LocalStorageNode CRD
//!
//! The node's observed storage: pools, their disks and the replicas they
//! hold. Written only by the registry on this node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::{Condition, State, Topology};
use super::local_disk::LocalDiskClaimSpec;

// =============================================================================
// LocalStorageNode CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalStorageNode",
    plural = "localstoragenodes",
    shortname = "lsn",
    status = "LocalStorageNodeStatus",
    printcolumn = r#"{"name": "IP", "type": "string", "jsonPath": ".spec.storageIP"}"#,
    printcolumn = r#"{"name": "Zone", "type": "string", "jsonPath": ".spec.topogoly.zone"}"#,
    printcolumn = r#"{"name": "Region", "type": "string", "jsonPath": ".spec.topogoly.region"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageNodeSpec {
    pub hostname: String,

    #[serde(rename = "storageIP", default)]
    pub storage_ip: String,

    // wire name carries a historical typo
    #[serde(rename = "topogoly", default)]
    pub topology: Topology,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageNodeStatus {
    #[serde(default)]
    pub pools: BTreeMap<String, LocalPool>,

    #[serde(default)]
    pub state: State,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Claims that extended each pool, deduplicated
    #[serde(default)]
    pub pool_extend_records: BTreeMap<String, Vec<LocalDiskClaimSpec>>,
}

// =============================================================================
// Pools and Devices
// =============================================================================

/// One per-media-class storage pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalPool {
    pub name: String,

    /// HDD, SSD or NVMe
    pub class: String,

    /// Always REGULAR
    pub r#type: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub total_capacity_bytes: i64,
    #[serde(default)]
    pub used_capacity_bytes: i64,
    #[serde(default)]
    pub volume_capacity_bytes_limit: i64,
    #[serde(default)]
    pub free_capacity_bytes: i64,

    #[serde(default)]
    pub total_volume_count: i64,
    #[serde(default)]
    pub used_volume_count: i64,
    #[serde(default)]
    pub free_volume_count: i64,

    #[serde(default)]
    pub disks: Vec<LocalDevice>,

    /// Names of the volumes held in this pool
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// A block device registered to a pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDevice {
    pub dev_path: String,

    /// Media class
    #[serde(rename = "type")]
    pub class: String,

    #[serde(default)]
    pub capacity_bytes: i64,

    #[serde(default)]
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DeviceState {
    #[default]
    Available,
    InUse,
    Offline,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Available => write!(f, "Available"),
            DeviceState::InUse => write!(f, "InUse"),
            DeviceState::Offline => write!(f, "Offline"),
        }
    }
}

/// Node condition types
pub mod node_conditions {
    pub const AVAILABLE: &str = "Available";
    pub const UNAVAILABLE: &str = "UnAvailable";
    pub const PROGRESSING: &str = "Progressing";
    pub const EXPAND_FAILURE: &str = "StorageExpandFailure";
    pub const EXPAND_SUCCESS: &str = "StorageExpandSuccess";
}

impl LocalStorageNode {
    pub fn storage_ip(&self) -> &str {
        &self.spec.storage_ip
    }

    pub fn status_mut(&mut self) -> &mut LocalStorageNodeStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
