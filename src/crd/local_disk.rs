//! LocalDisk and LocalDiskClaim CRDs
//!
//! Disks are discovered by the disk manager; a bound claim hands them to
//! this node's pools.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// LocalDisk CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDisk",
    plural = "localdisks",
    shortname = "ld",
    status = "LocalDiskStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.devicePath"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskSpec {
    pub node_name: String,

    #[serde(default)]
    pub device_path: String,

    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub partitioned: bool,

    #[serde(default)]
    pub disk_attributes: DiskAttributes,

    #[serde(default)]
    pub state: LocalDiskState,

    /// Name of the claim holding this disk
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claim_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskAttributes {
    /// Media class: HDD, SSD, NVMe
    #[serde(default)]
    pub r#type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
}

/// Link state of the physical disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LocalDiskState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskStatus {
    #[serde(default)]
    pub state: LocalDiskClaimState,
}

impl LocalDisk {
    /// Active, unpartitioned and addressable through a usable device path
    pub fn is_usable(&self) -> bool {
        self.spec.state == LocalDiskState::Active
            && !self.spec.partitioned
            && is_valid_device_path(&self.spec.device_path)
    }

    pub fn is_bound(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.state == LocalDiskClaimState::Bound)
            .unwrap_or(false)
    }
}

/// Paths outside /dev and device-mapper nodes never join a pool
pub fn is_valid_device_path(path: &str) -> bool {
    !path.is_empty() && path.starts_with("/dev") && !path.contains("mapper")
}

// =============================================================================
// LocalDiskClaim CRD
// =============================================================================

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "hwameistor.io",
    version = "v1alpha1",
    kind = "LocalDiskClaim",
    plural = "localdiskclaims",
    shortname = "ldc",
    status = "LocalDiskClaimStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Status", "type": "string", "jsonPath": ".status.status"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimSpec {
    pub node_name: String,

    #[serde(default)]
    pub description: DiskClaimDescription,

    /// Disks bound to this claim
    #[serde(default)]
    pub disk_refs: Vec<DiskRef>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskClaimDescription {
    /// Media class wanted: HDD, SSD, NVMe
    #[serde(default)]
    pub disk_type: String,

    #[serde(default)]
    pub capacity: i64,

    #[serde(default)]
    pub local_disk_names: Vec<String>,

    #[serde(default)]
    pub device_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DiskRef {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalDiskClaimStatus {
    #[serde(default)]
    pub status: LocalDiskClaimState,
}

/// Claim phase; also used as the disk's bind state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum LocalDiskClaimState {
    #[default]
    #[serde(rename = "")]
    Empty,
    Pending,
    Extending,
    Available,
    Bound,
    Consumed,
    ToBeDeleted,
    Deleted,
}

impl std::fmt::Display for LocalDiskClaimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LocalDiskClaimState::Empty => "",
            LocalDiskClaimState::Pending => "Pending",
            LocalDiskClaimState::Extending => "Extending",
            LocalDiskClaimState::Available => "Available",
            LocalDiskClaimState::Bound => "Bound",
            LocalDiskClaimState::Consumed => "Consumed",
            LocalDiskClaimState::ToBeDeleted => "ToBeDeleted",
            LocalDiskClaimState::Deleted => "Deleted",
        };
        write!(f, "{}", s)
    }
}

impl LocalDiskClaim {
    pub fn phase(&self) -> LocalDiskClaimState {
        self.status.as_ref().map(|s| s.status).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_filter() {
        assert!(is_valid_device_path("/dev/sdf"));
        assert!(!is_valid_device_path(""));
        assert!(!is_valid_device_path("/tmp/sdf"));
        assert!(!is_valid_device_path("/dev/mapper/vg-lv"));
    }

    #[test]
    fn test_disk_usable() {
        let mut disk = LocalDisk::new(
            "localdisk-1",
            LocalDiskSpec {
                node_name: "n1".into(),
                device_path: "/dev/sdf".into(),
                capacity: 2 << 30,
                state: LocalDiskState::Active,
                ..Default::default()
            },
        );
        assert!(disk.is_usable());
        assert!(!disk.is_bound());

        disk.spec.partitioned = true;
        assert!(!disk.is_usable());
    }

    #[test]
    fn test_claim_phase_wire() {
        let status: LocalDiskClaimStatus =
            serde_json::from_value(serde_json::json!({"status": "Bound"})).unwrap();
        assert_eq!(status.status, LocalDiskClaimState::Bound);
        let status: LocalDiskClaimStatus = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(status.status, LocalDiskClaimState::Empty);
    }
}
