//! Types shared by several custom resources

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Lifecycle State
// =============================================================================

/// Lifecycle state used by volumes, replicas, replica snapshots and nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum State {
    #[default]
    #[serde(rename = "")]
    Empty,
    Creating,
    NotReady,
    Ready,
    ToBeDeleted,
    Deleted,
}

impl State {
    /// ToBeDeleted or Deleted
    pub fn is_deleting(&self) -> bool {
        matches!(self, State::ToBeDeleted | State::Deleted)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Empty => write!(f, ""),
            State::Creating => write!(f, "Creating"),
            State::NotReady => write!(f, "NotReady"),
            State::Ready => write!(f, "Ready"),
            State::ToBeDeleted => write!(f, "ToBeDeleted"),
            State::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Condition status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

// =============================================================================
// Placement
// =============================================================================

/// Node topology labels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

/// Where a volume may be accessed from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityTopology {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub zones: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

/// IO limits as quantity strings; empty means unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeQoS {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub throughput: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iops: String,
}

// =============================================================================
// Conditions
// =============================================================================

/// Generic status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            r#type: r#type.into(),
            status,
            last_update_time: Some(now),
            last_transition_time: Some(now),
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Replace the condition with the same type, or append it.
///
/// The transition time is preserved when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}
