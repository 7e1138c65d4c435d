//! Grown disks: resize the physical volume behind a pool member

use super::manager::NodeManager;
use crate::crd::{DeviceState, LocalDevice};
use crate::error::Result;
use crate::store::get_optional;
use tracing::{debug, info};

impl NodeManager {
    pub(super) async fn process_disk(&self, name: &str) -> Result<()> {
        let Some(disk) = get_optional(self.stores.disks.as_ref(), name).await? else {
            info!(disk = %name, "Disk not found, should be deleted already");
            return Ok(());
        };
        if disk.spec.node_name != self.name {
            return Ok(());
        }
        if !disk.is_usable() || !disk.is_bound() {
            debug!(disk = %name, state = ?disk.spec.state, "Disk is not an active pool member");
            return Ok(());
        }

        let path = &disk.spec.device_path;
        let Some(known) = self.storage.registry().disks().get(path).cloned() else {
            debug!(disk = %name, path = %path, "Disk does not back any pool yet");
            return Ok(());
        };
        if known.capacity_bytes == disk.spec.capacity {
            return Ok(());
        }

        info!(
            disk = %name,
            path = %path,
            from = known.capacity_bytes,
            to = disk.spec.capacity,
            "Disk capacity changed, resizing physical volume"
        );
        let device = LocalDevice {
            capacity_bytes: disk.spec.capacity,
            state: DeviceState::InUse,
            ..known
        };
        self.storage
            .pool_manager()
            .resize_physical_volumes(std::slice::from_ref(&device))
            .await?;
        self.storage.registry().sync_node_resources().await
    }
}

#[cfg(test)]
mod tests {
    use crate::crd::{
        LocalDisk, LocalDiskClaimState, LocalDiskSpec, LocalDiskState, LocalDiskStatus,
    };
    use crate::node::manager::tests::harness;
    use crate::store::Store;

    fn disk(path: &str, capacity: i64, bound: bool) -> LocalDisk {
        let mut disk = LocalDisk::new(
            "disk-b",
            LocalDiskSpec {
                node_name: "n1".into(),
                device_path: path.into(),
                capacity,
                state: LocalDiskState::Active,
                ..Default::default()
            },
        );
        if bound {
            disk.status = Some(LocalDiskStatus {
                state: LocalDiskClaimState::Bound,
            });
        }
        disk
    }

    #[tokio::test]
    async fn test_grown_disk_is_resized() {
        let h = harness().await;
        h.stores.disks.create(&disk("/dev/sdb", 20 << 30, true)).await.unwrap();

        h.manager.process_disk("disk-b").await.unwrap();
        assert_eq!(
            h.exec.calls_matching("pvresize"),
            vec!["pvresize /dev/sdb -y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unchanged_or_unbound_disk_is_left_alone() {
        let h = harness().await;
        // matches the 10 GiB physical volume on the host
        h.stores.disks.create(&disk("/dev/sdb", 10 << 30, true)).await.unwrap();
        h.manager.process_disk("disk-b").await.unwrap();

        h.stores.disks.delete("disk-b").await.unwrap();
        h.stores.disks.create(&disk("/dev/sdb", 20 << 30, false)).await.unwrap();
        h.manager.process_disk("disk-b").await.unwrap();

        h.stores.disks.delete("disk-b").await.unwrap();
        h.stores.disks.create(&disk("/dev/sdz", 20 << 30, true)).await.unwrap();
        h.manager.process_disk("disk-b").await.unwrap();

        assert!(h.exec.calls_matching("pvresize").is_empty());
    }
}
