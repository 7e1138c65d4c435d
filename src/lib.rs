//! HwameiStor Local Storage - per-node local volume manager
//!
//! Runs on every storage node. Keeps the node's LVM pools, volume replicas,
//! snapshots and DRBD replication in line with the cluster's declared
//! volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              NodeManager                             │
//! │   informers ──► task queues ──► workers (volume, replica, snapshot,  │
//! │                                 restore, disk claim, disk)           │
//! ├───────────────────────────────┬──────────────────────────────────────┤
//! │         LocalManager          │            ConfigManager             │
//! │  pools · replicas · snapshots │   DRBD resources of HA replicas      │
//! │  registry (LocalStorageNode)  │   HA state sync                      │
//! ├───────────────────────────────┴──────────────────────────────────────┤
//! │        LVM / dd / drbdadm via nsenter        │     cgroup I/O QoS    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`node`]: node manager, task workers and the HA config manager
//! - [`storage`]: LVM pools, replicas, snapshots and the node registry
//! - [`configer`]: replication configurers (DRBD or none)
//! - [`qos`]: per-volume cgroup throttling
//! - [`store`]: object stores, Kubernetes or in-memory
//! - [`crd`]: Custom Resource Definitions
//! - [`error`]: Error types and handling

pub mod config;
pub mod configer;
pub mod crd;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod node;
pub mod qos;
pub mod queue;
pub mod storage;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use config::{NodeConfig, NodeManagerOptions, SystemConfig, SystemMode};

pub use crd::{
    LocalDisk, LocalDiskClaim, LocalStorageNode, LocalVolume, LocalVolumeReplica,
    LocalVolumeReplicaSnapshot, LocalVolumeReplicaSnapshotRestore, LocalVolumeSnapshot, State,
};

pub use error::{Error, ErrorAction, Result};

pub use exec::{CommandExecutor, NsExecutor};

pub use node::{ConfigManager, NodeManager};

pub use storage::{LocalManager, LocalRegistry, LvmExecutor};

pub use store::{Store, Stores};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
