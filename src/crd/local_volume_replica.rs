//! LocalVolumeReplica CRD
//!
//! One on-node materialisation of a LocalVolume. Owned by the node named in
//! `spec.nodeName`; every other node treats it as read-only.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{State, VolumeQoS};

// =============================================================================
// LocalVolumeReplica CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolumeReplica",
    plural = "localvolumereplicas",
    shortname = "lvr",
    status = "LocalVolumeReplicaStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.requiredCapacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Synced", "type": "boolean", "jsonPath": ".status.synced"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaSpec {
    pub volume_name: String,

    #[serde(default)]
    pub pool_name: String,

    pub node_name: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub volume_qos: VolumeQoS,

    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeReplicaStatus {
    /// Raw block device of the logical volume
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_path: String,

    /// Path consumers use; a replication symlink for HA volumes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_path: String,

    #[serde(default)]
    pub disks: Vec<String>,

    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    #[serde(default)]
    pub state: State,

    #[serde(default)]
    pub synced: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_state: Option<HAState>,

    #[serde(default)]
    pub inuse: bool,
}

// =============================================================================
// HA State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HAStateKind {
    Consistent,
    #[default]
    Inconsistent,
    Up,
    Down,
}

impl std::fmt::Display for HAStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HAStateKind::Consistent => write!(f, "Consistent"),
            HAStateKind::Inconsistent => write!(f, "Inconsistent"),
            HAStateKind::Up => write!(f, "Up"),
            HAStateKind::Down => write!(f, "Down"),
        }
    }
}

/// Replication sub-state of an HA replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HAState {
    pub state: HAStateKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl HAState {
    pub fn new(state: HAStateKind, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
        }
    }

    /// Replica state implied by this HA state
    pub fn replica_state(&self) -> State {
        match self.state {
            HAStateKind::Consistent => State::Ready,
            _ => State::NotReady,
        }
    }
}

// =============================================================================
// Helper Implementations
// =============================================================================

impl LocalVolumeReplica {
    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn allocated_bytes(&self) -> i64 {
        self.status
            .as_ref()
            .map(|s| s.allocated_capacity_bytes)
            .unwrap_or(0)
    }

    pub fn storage_path(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.storage_path.as_str())
            .unwrap_or("")
    }

    pub fn status_mut(&mut self) -> &mut LocalVolumeReplicaStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
