//! LocalVolume CRD
//!
//! The logical unit requested by users. The cluster scheduler fills in
//! `spec.config`; each node reconciles its local replica against it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{AccessibilityTopology, Condition, State, VolumeQoS};
use crate::error::{Error, Result};
use crate::utils::LVM_EXTENT_BYTES;

/// Largest replica count a volume may carry (4 during migration)
pub const MAX_REPLICA_NUMBER: i64 = 4;

// =============================================================================
// LocalVolume CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalVolume",
    plural = "localvolumes",
    shortname = "lv",
    status = "LocalVolumeStatus",
    printcolumn = r#"{"name": "Pool", "type": "string", "jsonPath": ".spec.poolName"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicaNumber"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.requiredCapacityBytes"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeSpec {
    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub volume_qos: VolumeQoS,

    /// e.g. LocalStorage_PoolHDD
    #[serde(default)]
    pub pool_name: String,

    /// 1 for non-HA, 2 for HA, 4 while migrating
    #[serde(default)]
    pub replica_number: i64,

    /// Whether a non-HA volume may later be converted to HA
    #[serde(default)]
    pub convertible: bool,

    #[serde(default)]
    pub accessibility: AccessibilityTopology,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc_namespace: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pvc_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volumegroup: String,

    /// Replica layout; absent until the scheduler assigns nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<VolumeConfig>,

    #[serde(default)]
    pub delete: bool,
}

/// Versioned replica layout used for HA coordination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeConfig {
    #[serde(default)]
    pub version: i64,

    #[serde(default)]
    pub volume_name: String,

    #[serde(default)]
    pub required_capacity_bytes: i64,

    #[serde(default)]
    pub convertible: bool,

    /// Replication resource id; -1 for non-HA volumes
    #[serde(rename = "resourceID", default)]
    pub resource_id: i64,

    #[serde(default)]
    pub ready_to_initialize: bool,

    #[serde(default)]
    pub initialized: bool,

    #[serde(default)]
    pub replicas: Vec<VolumeReplicaConfig>,
}

/// One replica slot in a [`VolumeConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReplicaConfig {
    #[serde(default)]
    pub id: i64,
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalVolumeStatus {
    #[serde(default)]
    pub allocated_capacity_bytes: i64,

    /// Names of the replicas materialising this volume
    #[serde(default)]
    pub replicas: Vec<String>,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub published_node: String,

    /// Filesystem the volume was formatted with when first published
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub published_fs_type: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Condition types recorded on a volume by the node agent
pub mod volume_conditions {
    pub const VALID: &str = "Valid";
}

// =============================================================================
// Helper Implementations
// =============================================================================

impl LocalVolumeSpec {
    /// Check the invariants every volume must hold
    pub fn validate(&self) -> Result<()> {
        if self.required_capacity_bytes < LVM_EXTENT_BYTES {
            return Err(Error::Validation(format!(
                "required capacity {} is less than {}",
                self.required_capacity_bytes, LVM_EXTENT_BYTES
            )));
        }
        if self.replica_number < 1 || self.replica_number > MAX_REPLICA_NUMBER {
            return Err(Error::Validation(format!(
                "replica number {} out of range [1, {}]",
                self.replica_number, MAX_REPLICA_NUMBER
            )));
        }
        if let Some(config) = &self.config {
            config.validate(self.replica_number)?;
        }
        Ok(())
    }
}

impl VolumeConfig {
    pub fn validate(&self, replica_number: i64) -> Result<()> {
        if (self.resource_id == -1) != (replica_number == 1) && !self.convertible {
            return Err(Error::Validation(format!(
                "resource id {} does not match replica number {}",
                self.resource_id, replica_number
            )));
        }
        if !self.replicas.is_empty() && self.replicas.len() as i64 != replica_number {
            return Err(Error::Validation(format!(
                "config lists {} replicas, volume wants {}",
                self.replicas.len(),
                replica_number
            )));
        }
        Ok(())
    }

    /// The layout entry for `hostname`, if this host is assigned
    pub fn replica_for(&self, hostname: &str) -> Option<&VolumeReplicaConfig> {
        self.replicas.iter().find(|r| r.hostname == hostname)
    }

    /// Whether the replicas are kept in sync by block replication
    pub fn is_ha(&self) -> bool {
        self.convertible && self.replicas.len() >= 2
    }
}

impl LocalVolume {
    pub fn config(&self) -> Option<&VolumeConfig> {
        self.spec.config.as_ref()
    }

    pub fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut LocalVolumeStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
