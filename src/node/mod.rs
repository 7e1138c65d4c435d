//! Node agent
//!
//! [`NodeManager`] turns volume assignments into replicas on this host and
//! drives replicas, snapshots, restores and disk claims to their desired
//! state. [`ConfigManager`] keeps the replication layer of HA replicas in
//! step with their volume's layout.

pub mod config_manager;
pub mod keys;
mod manager;
pub mod mount;
mod register;
mod informers;

mod data_copy_worker;
mod disk_claim_worker;
mod disk_worker;
mod replica_snapshot_worker;
mod replica_worker;
mod restore_worker;
mod volume_snapshot_worker;
mod volume_worker;

pub use config_manager::ConfigManager;
pub use manager::NodeManager;
pub use register::{node_topology, storage_ipv4_address};
