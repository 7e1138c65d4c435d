//! Snapshot CRDs
//!
//! `LocalVolumeSnapshot` is the cluster-wide request; every node holding a
//! replica of the source volume materialises it as a
//! `LocalVolumeReplicaSnapshot`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{AccessibilityTopology, Condition, State};

// =============================================================================
// LocalVolumeSnapshot CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeSnapshot",
    plural = "localvolumesnapshots",
    shortname = "lvs",
    status = "LocalVolumeSnapshotStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.sourceVolume"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSnapshotSpec {
    pub source_volume: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    /// Nodes holding a replica of the source volume
    #[serde(default)]
    pub accessibility: AccessibilityTopology,

    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSnapshotStatus {
    #[serde(default)]
    pub replica_snapshots: Vec<String>,

    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl LocalVolumeSnapshot {
    /// Whether this host is expected to materialise the snapshot
    pub fn is_assigned_to(&self, node: &str) -> bool {
        self.spec.accessibility.nodes.iter().any(|n| n == node)
    }
}

// =============================================================================
// LocalVolumeReplicaSnapshot CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeReplicaSnapshot",
    plural = "localvolumereplicasnapshots",
    shortname = "lvrs",
    status = "LocalVolumeReplicaSnapshotStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.sourceVolume"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaSnapshotSpec {
    pub node_name: String,

    pub source_volume: String,

    #[serde(default)]
    pub source_volume_replica: String,

    #[serde(default)]
    pub pool_name: String,

    /// Cluster-wide snapshot name; also the on-host snapshot LV name
    pub volume_snapshot_name: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaSnapshotStatus {
    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub attr: SnapshotAttr,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotAttr {
    #[serde(default)]
    pub merging: bool,
    #[serde(default)]
    pub invalid: bool,
}

/// Condition types recorded as a replica snapshot moves through its lifecycle
pub mod snapshot_conditions {
    pub const SUBMIT: &str = "Submit";
    pub const CREATE: &str = "Create";
    pub const READY_OR_NOT: &str = "ReadyOrNot";
    pub const DELETE: &str = "Delete";
}

impl LocalVolumeReplicaSnapshot {
    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut LocalVolumeReplicaSnapshotStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
