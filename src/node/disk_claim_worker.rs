//! Pool expansion from bound disk claims

use super::manager::NodeManager;
use crate::crd::{
    node_conditions, Condition, ConditionStatus, DeviceState, LocalDevice, LocalDiskClaim,
    LocalDiskClaimState,
};
use crate::error::Result;
use crate::storage::pool_name_for_class;
use crate::store::get_optional;
use tracing::{debug, error, info};

impl NodeManager {
    pub(super) async fn process_disk_claim(&self, name: &str) -> Result<()> {
        let Some(claim) = get_optional(self.stores.disk_claims.as_ref(), name).await? else {
            info!(claim = %name, "Disk claim not found, should be deleted already");
            return Ok(());
        };
        if claim.spec.node_name != self.name {
            return Ok(());
        }

        match claim.phase() {
            LocalDiskClaimState::Bound => {
                let result = self.consume_disk_claim(claim.clone()).await;
                self.record_expand_condition(&claim, &result).await;
                result.map(|_| ())
            }
            phase => {
                debug!(claim = %name, phase = %phase, "Disk claim not bound, nothing to do");
                Ok(())
            }
        }
    }

    /// Add the claim's disks to their pool; returns whether a pool grew
    async fn consume_disk_claim(&self, mut claim: LocalDiskClaim) -> Result<bool> {
        let devices = self.claimed_devices(&claim).await?;
        debug!(claim = %claim.metadata.name.as_deref().unwrap_or_default(), disks = devices.len(), "Extending pools");

        let extended = self.storage.pool_manager().extend_pools(&devices).await?;
        self.storage.registry().sync_node_resources().await?;

        let pool = pool_name_for_class(&claim.spec.description.disk_type)?;
        self.storage
            .registry()
            .update_pool_extend_record(pool, claim.spec.clone())
            .await?;

        claim.status.get_or_insert_with(Default::default).status = LocalDiskClaimState::Consumed;
        self.stores.disk_claims.update_status(&claim).await?;
        info!(claim = %claim.metadata.name.as_deref().unwrap_or_default(), pool = %pool, extended, "Disk claim consumed");
        Ok(extended)
    }

    /// Usable disks referenced by the claim; missing ones are skipped
    async fn claimed_devices(&self, claim: &LocalDiskClaim) -> Result<Vec<LocalDevice>> {
        let mut devices = Vec::new();
        for disk_ref in &claim.spec.disk_refs {
            let Some(disk) = get_optional(self.stores.disks.as_ref(), &disk_ref.name).await? else {
                debug!(disk = %disk_ref.name, "Claimed disk not found, skipping");
                continue;
            };
            if !disk.is_usable() {
                debug!(disk = %disk_ref.name, "Claimed disk is not usable, skipping");
                continue;
            }
            devices.push(LocalDevice {
                dev_path: disk.spec.device_path.clone(),
                class: disk.spec.disk_attributes.r#type.clone(),
                capacity_bytes: disk.spec.capacity,
                state: DeviceState::Available,
            });
        }
        Ok(devices)
    }

    async fn record_expand_condition(&self, claim: &LocalDiskClaim, result: &Result<bool>) {
        let reason = format!("Storage{}", claim.spec.description.disk_type);
        let (r#type, message) = match result {
            Err(e) => (
                node_conditions::EXPAND_FAILURE,
                format!("Failed to expand storage capacity, err: {}", e),
            ),
            Ok(true) => (
                node_conditions::EXPAND_SUCCESS,
                "Successfully to expand storage capacity".to_string(),
            ),
            Ok(false) if !self.storage.registry().disks().is_empty() => (
                node_conditions::AVAILABLE,
                "Sufficient storage capacity".to_string(),
            ),
            Ok(false) => (
                node_conditions::UNAVAILABLE,
                "Insufficient storage capacity".to_string(),
            ),
        };

        let condition = Condition::new(r#type, ConditionStatus::True, reason, message);
        if let Err(e) = self.storage.registry().update_condition(condition).await {
            error!(error = %e, "Failed to record storage node condition");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::crd::{
        node_conditions, DiskAttributes, DiskClaimDescription, DiskRef, LocalDisk,
        LocalDiskClaim, LocalDiskClaimSpec, LocalDiskClaimState, LocalDiskClaimStatus,
        LocalDiskSpec, LocalDiskState, LocalStorageNode,
    };
    use crate::error::Error;
    use crate::exec::ExecResult;
    use crate::node::manager::tests::{harness, harness_with, Harness};
    use crate::storage::lvm::tests::scripted;
    use crate::store::Store;
    use assert_matches::assert_matches;

    fn disk(name: &str, path: &str, class: &str) -> LocalDisk {
        LocalDisk::new(
            name,
            LocalDiskSpec {
                node_name: "n1".into(),
                device_path: path.into(),
                capacity: 20 << 30,
                disk_attributes: DiskAttributes {
                    r#type: class.into(),
                    ..Default::default()
                },
                state: LocalDiskState::Active,
                claim_ref: "claim-1".into(),
                ..Default::default()
            },
        )
    }

    async fn seed_claim(h: &Harness, disks: &[&str], phase: LocalDiskClaimState) {
        let mut claim = LocalDiskClaim::new(
            "claim-1",
            LocalDiskClaimSpec {
                node_name: "n1".into(),
                description: DiskClaimDescription {
                    disk_type: "HDD".into(),
                    ..Default::default()
                },
                disk_refs: disks.iter().map(|d| DiskRef { name: d.to_string() }).collect(),
                owner: String::new(),
            },
        );
        claim.status = Some(LocalDiskClaimStatus { status: phase });
        h.stores.disk_claims.create(&claim).await.unwrap();
    }

    async fn node(h: &Harness) -> LocalStorageNode {
        h.stores.storage_nodes.get("n1").await.unwrap()
    }

    fn has_condition(node: &LocalStorageNode, r#type: &str) -> bool {
        node.status
            .as_ref()
            .map(|s| s.conditions.iter().any(|c| c.r#type == r#type))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_bound_claim_extends_pool() {
        let h = harness().await;
        h.stores.disks.create(&disk("disk-c", "/dev/sdc", "HDD")).await.unwrap();
        let mut partitioned = disk("disk-d", "/dev/sdd", "HDD");
        partitioned.spec.partitioned = true;
        h.stores.disks.create(&partitioned).await.unwrap();
        seed_claim(&h, &["disk-c", "disk-d", "disk-missing"], LocalDiskClaimState::Bound).await;

        h.manager.process_disk_claim("claim-1").await.unwrap();

        assert_eq!(
            h.exec.calls_matching("vgextend"),
            vec!["vgextend LocalStorage_PoolHDD -y /dev/sdc".to_string()]
        );
        let claim = h.stores.disk_claims.get("claim-1").await.unwrap();
        assert_eq!(claim.phase(), LocalDiskClaimState::Consumed);

        let node = node(&h).await;
        assert!(has_condition(&node, node_conditions::EXPAND_SUCCESS));
        let records = &node.status.as_ref().unwrap().pool_extend_records;
        assert_eq!(records["LocalStorage_PoolHDD"].len(), 1);
        assert_eq!(records["LocalStorage_PoolHDD"][0].node_name, "n1");
    }

    #[tokio::test]
    async fn test_claim_with_pooled_disk_reports_available() {
        let h = harness().await;
        h.stores.disks.create(&disk("disk-b", "/dev/sdb", "HDD")).await.unwrap();
        seed_claim(&h, &["disk-b"], LocalDiskClaimState::Bound).await;

        h.manager.process_disk_claim("claim-1").await.unwrap();
        assert!(h.exec.calls_matching("vgextend").is_empty());
        assert!(has_condition(&node(&h).await, node_conditions::AVAILABLE));
    }

    #[tokio::test]
    async fn test_failed_extension_records_failure() {
        let exec = scripted();
        exec.on("vgextend ", ExecResult::failed(5, "Device /dev/sdc excluded by a filter"));
        let h = harness_with(exec).await;
        h.stores.disks.create(&disk("disk-c", "/dev/sdc", "HDD")).await.unwrap();
        seed_claim(&h, &["disk-c"], LocalDiskClaimState::Bound).await;

        assert_matches!(
            h.manager.process_disk_claim("claim-1").await,
            Err(Error::Command { .. })
        );
        let claim = h.stores.disk_claims.get("claim-1").await.unwrap();
        assert_eq!(claim.phase(), LocalDiskClaimState::Bound);

        let node = node(&h).await;
        let condition = node
            .status
            .unwrap()
            .conditions
            .into_iter()
            .find(|c| c.r#type == node_conditions::EXPAND_FAILURE)
            .unwrap();
        assert_eq!(condition.reason, "StorageHDD");
        assert!(condition.message.starts_with("Failed to expand storage capacity"));
    }

    #[tokio::test]
    async fn test_pending_claim_is_ignored() {
        let h = harness().await;
        h.stores.disks.create(&disk("disk-c", "/dev/sdc", "HDD")).await.unwrap();
        seed_claim(&h, &["disk-c"], LocalDiskClaimState::Pending).await;

        h.manager.process_disk_claim("claim-1").await.unwrap();
        h.manager.process_disk_claim("claim-missing").await.unwrap();
        assert!(h.exec.calls_matching("vgextend").is_empty());
        assert_eq!(
            h.stores.disk_claims.get("claim-1").await.unwrap().phase(),
            LocalDiskClaimState::Pending
        );
    }
}
