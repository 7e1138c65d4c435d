//! LocalVolumeReplicaSnapshotRestore CRD
//!
//! Per-node half of a snapshot restore. `rollback` merges the snapshot into
//! its source volume; `create` copies it into a new volume.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// LocalVolumeReplicaSnapshotRestore CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeReplicaSnapshotRestore",
    plural = "localvolumereplicasnapshotrestores",
    shortname = "lvrsrestore",
    status = "SnapshotRestoreStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.restoreType"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaSnapshotRestoreSpec {
    pub node_name: String,

    pub target_volume: String,

    pub target_pool_name: String,

    /// On-host snapshot LV name
    pub source_volume_snapshot: String,

    #[serde(default)]
    pub source_volume_replica_snapshot: String,

    #[serde(default)]
    pub restore_type: RestoreType,

    /// Name of the cluster-wide restore this belongs to
    #[serde(default)]
    pub volume_snapshot_restore: String,

    #[serde(default)]
    pub abort: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RestoreType {
    Rollback,
    #[default]
    Create,
}

impl std::fmt::Display for RestoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreType::Rollback => write!(f, "rollback"),
            RestoreType::Create => write!(f, "create"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum RestoreState {
    #[default]
    #[serde(rename = "")]
    Empty,
    Submitted,
    InProgress,
    Completed,
    ToBeAborted,
    Aborted,
}

impl std::fmt::Display for RestoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreState::Empty => write!(f, ""),
            RestoreState::Submitted => write!(f, "Submitted"),
            RestoreState::InProgress => write!(f, "InProgress"),
            RestoreState::Completed => write!(f, "Completed"),
            RestoreState::ToBeAborted => write!(f, "ToBeAborted"),
            RestoreState::Aborted => write!(f, "Aborted"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRestoreStatus {
    #[serde(default)]
    pub state: RestoreState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl LocalVolumeReplicaSnapshotRestore {
    pub fn state(&self) -> RestoreState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
