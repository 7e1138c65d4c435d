//! Custom Resource Definitions consumed and published by the node agent
//!
//! - LocalVolume: requested volume and its replica layout
//! - LocalVolumeReplica: one on-node materialisation of a volume
//! - LocalVolumeSnapshot / LocalVolumeReplicaSnapshot: COW snapshots
//! - LocalVolumeReplicaSnapshotRestore: rollback or copy from a snapshot
//! - LocalStorageNode: the node's pools and conditions
//! - LocalDisk / LocalDiskClaim: disks offered to the node's pools

pub mod common;
pub mod local_disk;
pub mod local_storage_node;
pub mod local_volume;
pub mod local_volume_replica;
pub mod local_volume_snapshot;
pub mod snapshot_restore;

pub use common::*;
pub use local_disk::*;
pub use local_storage_node::*;
pub use local_volume::*;
pub use local_volume_replica::*;
pub use local_volume_snapshot::*;
pub use snapshot_restore::*;
