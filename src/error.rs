//! Error types for the local volume manager
//!
//! Provides structured error types for every node component including
//! the declarative store, LVM pools, replication and snapshot handling.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the node agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource update conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Watch stream error: {0}")]
    Watch(String),

    // =========================================================================
    // Host Command Errors
    // =========================================================================
    #[error("Command failed: {command} - {reason}")]
    Command { command: String, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Volume replica not found on host: {0}")]
    ReplicaNotFound(String),

    #[error("Volume replica snapshot not found on host: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot is merging: {0}")]
    SnapshotMerging(String),

    #[error("Snapshot is expiration: {0}")]
    SnapshotInvalid(String),

    #[error("Device {device} is mounted at {mount_points:?}")]
    DeviceMounted {
        device: String,
        mount_points: Vec<String>,
    },

    #[error("Replicas of volume {volume} are not ready: {reason}")]
    ReplicasNotReady { volume: String, reason: String },

    #[error("Volume {volume} still has {count} snapshot(s)")]
    DependentSnapshots { volume: String, count: usize },

    #[error("Not supported pool class: {0}")]
    UnsupportedPoolClass(String),

    #[error("Insufficient resources in pool {pool}: {reason}")]
    InsufficientResources { pool: String, reason: String },

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Replication resource {resource} is not connected: {state}")]
    NotConnected { resource: String, state: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("Time parse error: {0}")]
    TimeParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Long running host-side work - poll
            Error::SnapshotMerging(_) => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Waiting on peers or other objects
            Error::NotConnected { .. }
            | Error::DependentSnapshots { .. }
            | Error::ReplicasNotReady { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(10))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::UnsupportedPoolClass(_)
            | Error::CapacityParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if the error means the object is already gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. }
            | Error::ReplicaNotFound(_)
            | Error::SnapshotNotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if the error is an optimistic concurrency failure
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Command {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the node agent
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::SnapshotMerging("snap-1".into());
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(5)));

        let err = Error::Validation("required capacity too small".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::DependentSnapshots {
            volume: "pvc-1".into(),
            count: 2,
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(10)));

        let err = Error::ReplicasNotReady {
            volume: "pvc-1".into(),
            reason: "replica n2 is Creating".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(10)));

        let err = Error::command("lvcreate", "exit status 5");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Conflict {
            kind: "LocalVolumeReplica".into(),
            name: "pvc-1-abcdef".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_conflict());

        let config_err = Error::UnsupportedPoolClass("TAPE".into());
        assert!(!config_err.is_retryable());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::not_found("LocalVolume", "pvc-1").is_not_found());
        assert!(Error::ReplicaNotFound("pvc-1".into()).is_not_found());
        assert!(Error::SnapshotNotFound("snap-1".into()).is_not_found());
        assert!(!Error::Internal("boom".into()).is_not_found());

        let api = kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(Error::Kube(api).is_not_found());
    }
}
