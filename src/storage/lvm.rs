//! LVM command driver
//!
//! Pools are volume groups, replicas are logical volumes and snapshots are
//! COW logical volumes. Every report is read as JSON with byte units.

use super::pools::{
    class_for_pool_name, pool_name_for_class, MAX_VOLUME_COUNT, POOL_NAME_PREFIX,
    POOL_TYPE_REGULAR,
};
use crate::crd::{
    DeviceState, LocalDevice, LocalPool, LocalVolumeReplica, LocalVolumeReplicaSnapshot,
    LocalVolumeReplicaSnapshotStatus, LocalVolumeReplicaSpec, LocalVolumeReplicaStatus,
    SnapshotAttr, State,
};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecParams};
use crate::utils::{parse_lvm_bytes, round_to_extent, to_lvm_bytes};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `lv_time` layout, e.g. `2024-03-01 10:20:30 +0800`
pub const LVM_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Placeholder LVM prints for an attribute that is not set
const LVM_UNKNOWN_STATUS: &str = "unknown";

const LVS_FIELDS: &str = "lv_path,lv_name,vg_name,lv_attr,lv_size,pool_lv,origin,data_percent,\
metadata_percent,move_pv,mirror_log,copy_percent,convert_lv,lv_snapshot_invalid,lv_merge_failed,\
snap_percent,lv_device_open,lv_merging,lv_converting,lv_time";

const ERR_LV_EXISTS: &str = "already exists in volume group";
const ERR_LV_NOT_FOUND: &str = "Failed to find logical volume";
const ERR_SAME_SIZE: &str = "matches existing size";

// =============================================================================
// Report Records
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct Report<T> {
    #[serde(default)]
    report: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct PvSection {
    #[serde(default)]
    pv: Vec<PvRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct VgSection {
    #[serde(default)]
    vg: Vec<VgRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<LvRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PvRecord {
    #[serde(default)]
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    #[serde(default)]
    pv_size: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct VgRecord {
    #[serde(default)]
    vg_name: String,
    #[serde(default)]
    vg_size: String,
    #[serde(default)]
    vg_free: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LvRecord {
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    lv_name: String,
    #[serde(default)]
    vg_name: String,
    #[serde(default)]
    lv_attr: String,
    #[serde(default)]
    lv_size: String,
    #[serde(default)]
    origin: String,
    #[serde(default)]
    lv_snapshot_invalid: String,
    #[serde(default)]
    lv_merging: String,
    #[serde(default)]
    lv_time: String,
}

impl LvRecord {
    fn is_snapshot(&self) -> bool {
        !self.origin.is_empty() || matches!(self.lv_attr.chars().next(), Some('s' | 'S'))
    }

    /// Internal LVs (mirror logs, thin pool data) are bracketed in `lvs -a`
    fn is_hidden(&self) -> bool {
        self.lv_name.starts_with('[')
    }

    /// A user-visible volume that backs a replica
    fn is_volume(&self) -> bool {
        !self.is_snapshot() && !self.is_hidden()
    }
}

/// Output of `lvdisplay -m`
#[derive(Debug, Clone, PartialEq, Eq)]
struct LvStatus {
    disks: Vec<String>,
    state: State,
}

/// A difference between declared replicas and the logical volumes on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    NotFoundOnHost { volume: String },
    NotDeclared { volume: String },
    StoragePath { volume: String, declared: String, actual: String },
    Capacity { volume: String, declared: i64, actual: i64 },
}

// =============================================================================
// LVM Executor
// =============================================================================

/// Drives LVM through a [`CommandExecutor`]
pub struct LvmExecutor {
    exec: Arc<dyn CommandExecutor>,
}

impl LvmExecutor {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self { exec }
    }

    // -------------------------------------------------------------------------
    // Pools
    // -------------------------------------------------------------------------

    /// Pools built from the volume groups carrying the pool prefix
    pub async fn get_pools(&self) -> Result<BTreeMap<String, LocalPool>> {
        let vgs = self.vgs().await?;
        let pvs = self.pvs().await?;
        let lvs = self.lvs().await?;

        let mut pools = BTreeMap::new();
        for vg in vgs.iter().filter(|vg| vg.vg_name.starts_with(POOL_NAME_PREFIX)) {
            let total = parse_lvm_bytes(&vg.vg_size)?;
            let free = parse_lvm_bytes(&vg.vg_free)?;
            let class = class_for_pool_name(&vg.vg_name).unwrap_or_default();
            if class.is_empty() {
                debug!(pool = %vg.vg_name, "Unrecognised pool class");
            }

            let mut disks = Vec::new();
            for pv in pvs.iter().filter(|pv| pv.vg_name == vg.vg_name) {
                disks.push(LocalDevice {
                    dev_path: pv.pv_name.clone(),
                    class: class.to_string(),
                    capacity_bytes: parse_lvm_bytes(&pv.pv_size)?,
                    state: DeviceState::InUse,
                });
            }

            let volumes: Vec<String> = lvs
                .iter()
                .filter(|lv| lv.vg_name == vg.vg_name && lv.is_volume())
                .map(|lv| lv.lv_name.clone())
                .collect();
            let used_volumes = volumes.len() as i64;

            pools.insert(
                vg.vg_name.clone(),
                LocalPool {
                    name: vg.vg_name.clone(),
                    class: class.to_string(),
                    r#type: POOL_TYPE_REGULAR.to_string(),
                    path: String::new(),
                    total_capacity_bytes: total,
                    used_capacity_bytes: total - free,
                    volume_capacity_bytes_limit: total,
                    free_capacity_bytes: free,
                    total_volume_count: MAX_VOLUME_COUNT,
                    used_volume_count: used_volumes,
                    free_volume_count: MAX_VOLUME_COUNT - used_volumes,
                    disks,
                    volumes,
                },
            );
        }
        Ok(pools)
    }

    /// Admit disks into the pool matching their class.
    ///
    /// Disks that already back a pool are skipped. Returns whether any pool
    /// changed.
    pub async fn extend_pools(&self, disks: &[LocalDevice]) -> Result<bool> {
        let existing_vgs: BTreeSet<String> =
            self.vgs().await?.into_iter().map(|vg| vg.vg_name).collect();
        let existing_pvs: BTreeSet<String> = self
            .pvs()
            .await?
            .into_iter()
            .filter(|pv| existing_vgs.contains(&pv.vg_name))
            .map(|pv| pv.pv_name)
            .collect();

        let mut by_pool: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for disk in disks {
            if !crate::crd::is_valid_device_path(&disk.dev_path) {
                debug!(disk = %disk.dev_path, "Skipping disk with unusable path");
                continue;
            }
            let pool = match pool_name_for_class(&disk.class) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!(disk = %disk.dev_path, error = %e, "Skipping disk");
                    continue;
                }
            };
            if existing_pvs.contains(&disk.dev_path) {
                continue;
            }
            let members = by_pool.entry(pool).or_default();
            if !members.contains(&disk.dev_path) {
                members.push(disk.dev_path.clone());
            }
        }

        let mut extended = false;
        for (pool, pvs) in by_pool {
            let cmd = if existing_vgs.contains(pool) {
                "vgextend"
            } else {
                "vgcreate"
            };
            info!(pool = %pool, disks = ?pvs, command = cmd, "Adding disks to pool");
            let args = [pool.to_string(), "-y".to_string()].into_iter().chain(pvs);
            self.exec.run_checked(ExecParams::new(cmd, args)).await?;
            extended = true;
        }
        Ok(extended)
    }

    /// Propagate grown disks into their physical volumes
    pub async fn resize_physical_volumes(&self, disks: &[LocalDevice]) -> Result<()> {
        for disk in disks {
            debug!(disk = %disk.dev_path, "Resizing physical volume");
            self.exec
                .run_checked(ExecParams::new("pvresize", [disk.dev_path.as_str(), "-y"]))
                .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Volume Replicas
    // -------------------------------------------------------------------------

    /// Replicas found on the host, keyed by volume name
    pub async fn get_replicas(&self) -> Result<BTreeMap<String, LocalVolumeReplica>> {
        let mut replicas = BTreeMap::new();
        for lv in self.lvs().await? {
            if !lv.vg_name.starts_with(POOL_NAME_PREFIX) || !lv.is_volume() {
                continue;
            }
            let mut replica = LocalVolumeReplica::new(
                &lv.lv_name,
                LocalVolumeReplicaSpec {
                    volume_name: lv.lv_name.clone(),
                    pool_name: lv.vg_name.clone(),
                    ..Default::default()
                },
            );
            replica.status = Some(LocalVolumeReplicaStatus {
                storage_path: lv.lv_path.clone(),
                dev_path: lv.lv_path.clone(),
                allocated_capacity_bytes: parse_lvm_bytes(&lv.lv_size)?,
                synced: true,
                ..Default::default()
            });
            let replica = match self.test_volume_replica(&replica).await {
                Ok(tested) => tested,
                Err(e) => {
                    warn!(volume = %lv.lv_name, error = %e, "Failed to inspect logical volume");
                    replica
                }
            };
            debug!(volume = %lv.lv_name, "Detected a logical volume");
            replicas.insert(lv.lv_name, replica);
        }
        Ok(replicas)
    }

    /// Allocate the logical volume; an existing one is reused
    pub async fn create_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
    ) -> Result<LocalVolumeReplica> {
        let spec = &replica.spec;
        let params = ExecParams::new(
            "lvcreate",
            [
                "--size".to_string(),
                to_lvm_bytes(spec.required_capacity_bytes),
                "--stripes".to_string(),
                "1".to_string(),
                spec.pool_name.clone(),
                "-n".to_string(),
                spec.volume_name.clone(),
                "-y".to_string(),
            ],
        );
        let result = self.exec.run(params.clone()).await?;
        if !result.success() && !result.stderr.contains(ERR_LV_EXISTS) {
            result.check(&params)?;
        }

        let record = self.lv_record(&spec.volume_name, &spec.pool_name).await?;
        let lv_status = self.lvdisplay(&record.lv_path).await?;

        let mut created = replica.clone();
        let status = created.status_mut();
        status.allocated_capacity_bytes = parse_lvm_bytes(&record.lv_size)?;
        status.storage_path = record.lv_path.clone();
        status.dev_path = record.lv_path;
        status.disks = lv_status.disks;
        Ok(created)
    }

    /// Grow the logical volume to `new_capacity_bytes`
    pub async fn expand_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
        new_capacity_bytes: i64,
    ) -> Result<LocalVolumeReplica> {
        if replica.allocated_bytes() == new_capacity_bytes {
            return Ok(replica.clone());
        }

        let params = ExecParams::new(
            "lvextend",
            [
                "--size".to_string(),
                format!("{}b", round_to_extent(new_capacity_bytes)),
                storage_path_of(replica).to_string(),
                "-y".to_string(),
            ],
        );
        let result = self.exec.run(params.clone()).await?;
        if !result.success() && !result.stderr.contains(ERR_SAME_SIZE) {
            result.check(&params)?;
        }

        let record = self
            .lv_record(&replica.spec.volume_name, &replica.spec.pool_name)
            .await?;
        let mut expanded = replica.clone();
        expanded.status_mut().allocated_capacity_bytes = parse_lvm_bytes(&record.lv_size)?;
        Ok(expanded)
    }

    /// Remove the logical volume; a missing volume is not an error
    pub async fn delete_volume_replica(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let params = ExecParams::new("lvremove", [storage_path_of(replica), "-y"]);
        let result = self.exec.run(params.clone()).await?;
        if !result.success() && result.stderr.contains(ERR_LV_NOT_FOUND) {
            debug!(volume = %replica.spec.volume_name, "Logical volume already gone");
            return Ok(());
        }
        result.check(&params)?;
        Ok(())
    }

    /// Refresh disks, state and the synced flag from `lvdisplay`
    pub async fn test_volume_replica(
        &self,
        replica: &LocalVolumeReplica,
    ) -> Result<LocalVolumeReplica> {
        let lv_status = self.lvdisplay(storage_path_of(replica)).await?;
        let mut tested = replica.clone();
        let status = tested.status_mut();
        status.synced = true;
        status.disks = lv_status.disks;
        status.state = lv_status.state;
        Ok(tested)
    }

    /// Compare declared replicas with the host in both directions
    pub async fn consistency_check(
        &self,
        declared: &BTreeMap<String, LocalVolumeReplica>,
    ) -> Result<Vec<Inconsistency>> {
        let on_host = self.get_replicas().await?;
        let mut found = Vec::new();

        for (volume, decl) in declared {
            match on_host.get(volume) {
                Some(actual) => found.extend(compare_replica(volume, decl, actual)),
                None => found.push(Inconsistency::NotFoundOnHost {
                    volume: volume.clone(),
                }),
            }
        }
        for volume in on_host.keys() {
            if !declared.contains_key(volume) {
                found.push(Inconsistency::NotDeclared {
                    volume: volume.clone(),
                });
            }
        }

        for item in &found {
            warn!(inconsistency = ?item, "Volume replica consistency check failed");
        }
        Ok(found)
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Whether a logical volume called `name` exists
    pub async fn lv_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lvs().await?.iter().any(|lv| lv.lv_name == name))
    }

    /// Read-only COW snapshot named after the cluster-wide snapshot
    pub async fn create_snapshot(&self, snapshot: &LocalVolumeReplicaSnapshot) -> Result<()> {
        let spec = &snapshot.spec;
        let replicas = self.get_replicas().await?;
        if !replicas.contains_key(&spec.source_volume) {
            return Err(Error::ReplicaNotFound(spec.source_volume.clone()));
        }

        let params = ExecParams::new(
            "lvcreate",
            [
                "--snapshot".to_string(),
                "--name".to_string(),
                spec.volume_snapshot_name.clone(),
                "--permission".to_string(),
                "r".to_string(),
                "--size".to_string(),
                to_lvm_bytes(spec.required_capacity_bytes),
                format!("{}/{}", spec.pool_name, spec.source_volume),
            ],
        );
        self.exec.run_checked(params).await?;
        debug!(snapshot = %spec.volume_snapshot_name, "Volume replica snapshot created");
        Ok(())
    }

    pub async fn delete_snapshot(&self, snapshot: &LocalVolumeReplicaSnapshot) -> Result<()> {
        let spec = &snapshot.spec;
        let target = format!("{}/{}", spec.pool_name, spec.volume_snapshot_name);
        let params = ExecParams::new("lvremove", [target.as_str(), "-y"]);
        let result = self.exec.run(params.clone()).await?;
        if !result.success() && result.stderr.contains(ERR_LV_NOT_FOUND) {
            return Ok(());
        }
        result.check(&params)?;
        Ok(())
    }

    /// Observed state of a snapshot
    pub async fn get_snapshot(
        &self,
        snapshot: &LocalVolumeReplicaSnapshot,
    ) -> Result<LocalVolumeReplicaSnapshotStatus> {
        let name = &snapshot.spec.volume_snapshot_name;
        let lv = self
            .lvs()
            .await?
            .into_iter()
            .find(|lv| &lv.lv_name == name)
            .ok_or_else(|| Error::SnapshotNotFound(name.clone()))?;

        let attr = SnapshotAttr {
            invalid: !lv.lv_snapshot_invalid.is_empty()
                && lv.lv_snapshot_invalid != LVM_UNKNOWN_STATUS,
            merging: !lv.lv_merging.is_empty(),
        };
        let creation_timestamp = parse_lv_time(&lv.lv_time);
        if creation_timestamp.is_none() && !lv.lv_time.is_empty() {
            warn!(snapshot = %name, lv_time = %lv.lv_time, "Unrecognised snapshot creation time");
        }

        let (state, message) = if attr.invalid {
            (State::NotReady, "snapshot is invalid".to_string())
        } else {
            (State::Ready, String::new())
        };

        Ok(LocalVolumeReplicaSnapshotStatus {
            allocated_capacity_bytes: parse_lvm_bytes(&lv.lv_size)?,
            creation_timestamp,
            attr,
            state,
            message,
            conditions: snapshot
                .status
                .as_ref()
                .map(|s| s.conditions.clone())
                .unwrap_or_default(),
        })
    }

    /// Merge a snapshot back into its origin; completes asynchronously
    pub async fn rollback_snapshot(&self, pool: &str, snapshot_name: &str) -> Result<()> {
        let target = format!("{}/{}", pool, snapshot_name);
        self.exec
            .run_checked(ExecParams::new("lvconvert", ["--merge", target.as_str()]))
            .await?;
        info!(snapshot = %target, "Snapshot merge started");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn report_json(&self, cmd: &str, extra: &[&str]) -> Result<String> {
        let args = extra
            .iter()
            .copied()
            .chain(["--reportformat", "json", "--units", "B"]);
        let result = self.exec.run_checked(ExecParams::new(cmd, args)).await?;
        Ok(result.stdout)
    }

    async fn pvs(&self) -> Result<Vec<PvRecord>> {
        let out = self.report_json("pvs", &[]).await?;
        let report: Report<PvSection> = serde_json::from_str(&out)?;
        Ok(report.report.into_iter().flat_map(|s| s.pv).collect())
    }

    async fn vgs(&self) -> Result<Vec<VgRecord>> {
        let out = self.report_json("vgs", &[]).await?;
        let report: Report<VgSection> = serde_json::from_str(&out)?;
        Ok(report.report.into_iter().flat_map(|s| s.vg).collect())
    }

    async fn lvs(&self) -> Result<Vec<LvRecord>> {
        let out = self.report_json("lvs", &["-a", "-o", LVS_FIELDS]).await?;
        let report: Report<LvSection> = serde_json::from_str(&out)?;
        // hidden volumes, e.g. a merging snapshot, print as "[name]"
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut records: Vec<LvRecord> = Vec::new();
        for mut lv in report.report.into_iter().flat_map(|s| s.lv) {
            if lv.lv_name.starts_with('[') && lv.lv_name.ends_with(']') {
                lv.lv_name = lv.lv_name[1..lv.lv_name.len() - 1].to_string();
            }
            match seen.get(&lv.lv_name) {
                Some(&i) => records[i] = lv,
                None => {
                    seen.insert(lv.lv_name.clone(), records.len());
                    records.push(lv);
                }
            }
        }
        Ok(records)
    }

    async fn lv_record(&self, lv_name: &str, vg_name: &str) -> Result<LvRecord> {
        self.lvs()
            .await?
            .into_iter()
            .find(|lv| lv.lv_name == lv_name && lv.vg_name == vg_name)
            .ok_or_else(|| Error::ReplicaNotFound(format!("{}/{}", vg_name, lv_name)))
    }

    async fn lvdisplay(&self, lv_path: &str) -> Result<LvStatus> {
        let result = self
            .exec
            .run_checked(ExecParams::new("lvdisplay", ["-m", lv_path]))
            .await?;
        Ok(parse_lvdisplay(&result.stdout))
    }
}

fn compare_replica(
    volume: &str,
    declared: &LocalVolumeReplica,
    actual: &LocalVolumeReplica,
) -> Vec<Inconsistency> {
    let mut found = Vec::new();
    if declared.storage_path() != actual.storage_path() {
        found.push(Inconsistency::StoragePath {
            volume: volume.to_string(),
            declared: declared.storage_path().to_string(),
            actual: actual.storage_path().to_string(),
        });
    }
    if declared.allocated_bytes() != actual.allocated_bytes() {
        found.push(Inconsistency::Capacity {
            volume: volume.to_string(),
            declared: declared.allocated_bytes(),
            actual: actual.allocated_bytes(),
        });
    }
    found
}

/// Older replicas only recorded the device path
fn storage_path_of(replica: &LocalVolumeReplica) -> &str {
    match replica.status.as_ref() {
        Some(s) if !s.storage_path.is_empty() => &s.storage_path,
        Some(s) => &s.dev_path,
        None => "",
    }
}

fn parse_lvdisplay(out: &str) -> LvStatus {
    let mut status = LvStatus {
        disks: Vec::new(),
        state: State::NotReady,
    };
    for line in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("Physical volume") {
            status.disks.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("LV Status") {
            if rest.trim() == "available" {
                status.state = State::Ready;
            }
        }
    }
    status
}

/// Parse `lv_time`; falls back to RFC 3339 and gives up quietly otherwise
pub fn parse_lv_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_str(s, LVM_TIME_LAYOUT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExecutor;
    use crate::exec::ExecResult;
    use assert_matches::assert_matches;

    pub(crate) const VGS: &str = r#"{"report":[{"vg":[
        {"vg_name":"LocalStorage_PoolHDD","pv_count":"1","lv_count":"1","snap_count":"0","vg_attr":"wz--n-","vg_size":"10737418240B","vg_free":"9663676416B"},
        {"vg_name":"centos","pv_count":"1","lv_count":"2","snap_count":"0","vg_attr":"wz--n-","vg_size":"53687091200B","vg_free":"0B"}
    ]}]}"#;

    pub(crate) const PVS: &str = r#"{"report":[{"pv":[
        {"pv_name":"/dev/sdb","vg_name":"LocalStorage_PoolHDD","pv_attr":"a--","pv_size":"10737418240B","pv_free":"9663676416B"},
        {"pv_name":"/dev/sda2","vg_name":"centos","pv_attr":"a--","pv_size":"53687091200B","pv_free":"0B"}
    ]}]}"#;

    pub(crate) const LVS: &str = r#"{"report":[{"lv":[
        {"lv_path":"/dev/LocalStorage_PoolHDD/pvc-1","lv_name":"pvc-1","vg_name":"LocalStorage_PoolHDD","lv_size":"1073741824B","origin":"","lv_snapshot_invalid":"","lv_merging":"","lv_time":"2024-03-01 10:20:30 +0800"},
        {"lv_path":"/dev/LocalStorage_PoolHDD/snap1","lv_name":"snap1","vg_name":"LocalStorage_PoolHDD","lv_size":"1073741824B","origin":"pvc-1","lv_snapshot_invalid":"unknown","lv_merging":"","lv_time":"2024-03-02 11:00:00 +0000"},
        {"lv_path":"/dev/centos/root","lv_name":"root","vg_name":"centos","lv_size":"53687091200B","origin":"","lv_time":""}
    ]}]}"#;

    pub(crate) const LVDISPLAY: &str = "  --- Logical volume ---\n  LV Path /dev/LocalStorage_PoolHDD/pvc-1\n  LV Status              available\n  --- Segments ---\n    Physical volume     /dev/sdb\n";

    pub(crate) fn scripted() -> Arc<ScriptedExecutor> {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("vgs ", ExecResult::ok(VGS))
            .on("pvs ", ExecResult::ok(PVS))
            .on("lvs ", ExecResult::ok(LVS))
            .on("lvdisplay ", ExecResult::ok(LVDISPLAY));
        exec
    }

    fn replica(volume: &str, required: i64) -> LocalVolumeReplica {
        LocalVolumeReplica::new(
            &format!("{}-abcdef", volume),
            LocalVolumeReplicaSpec {
                volume_name: volume.into(),
                pool_name: "LocalStorage_PoolHDD".into(),
                node_name: "n1".into(),
                required_capacity_bytes: required,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_get_pools() {
        let lvm = LvmExecutor::new(scripted());
        let pools = lvm.get_pools().await.unwrap();
        assert_eq!(pools.len(), 1);

        let pool = &pools["LocalStorage_PoolHDD"];
        assert_eq!(pool.class, "HDD");
        assert_eq!(pool.total_capacity_bytes, 10737418240);
        assert_eq!(
            pool.used_capacity_bytes + pool.free_capacity_bytes,
            pool.total_capacity_bytes
        );
        assert_eq!(pool.used_volume_count + pool.free_volume_count, MAX_VOLUME_COUNT);
        assert_eq!(pool.disks.len(), 1);
        assert_eq!(pool.disks[0].state, DeviceState::InUse);
    }

    #[tokio::test]
    async fn test_pool_volumes_exclude_snapshots_and_hidden_lvs() {
        let exec = scripted();
        let lvs = r#"{"report":[{"lv":[
            {"lv_path":"/dev/LocalStorage_PoolHDD/pvc-1","lv_name":"pvc-1","vg_name":"LocalStorage_PoolHDD","lv_attr":"owi-a-----","lv_size":"1073741824B","origin":""},
            {"lv_path":"/dev/LocalStorage_PoolHDD/snap1","lv_name":"snap1","vg_name":"LocalStorage_PoolHDD","lv_attr":"swi-a-s---","lv_size":"1073741824B","origin":"pvc-1"},
            {"lv_path":"","lv_name":"[pvc-2_mlog]","vg_name":"LocalStorage_PoolHDD","lv_attr":"ewi-ao----","lv_size":"4194304B","origin":""}
        ]}]}"#;
        exec.on_once("lvs ", ExecResult::ok(lvs));
        let lvm = LvmExecutor::new(exec.clone());

        let pool = &lvm.get_pools().await.unwrap()["LocalStorage_PoolHDD"];
        assert_eq!(pool.volumes, vec!["pvc-1".to_string()]);
        assert_eq!(pool.used_volume_count, 1);
        assert_eq!(pool.free_volume_count, MAX_VOLUME_COUNT - 1);

        exec.on_once("lvs ", ExecResult::ok(lvs));
        let replicas = lvm.get_replicas().await.unwrap();
        assert_eq!(replicas.keys().collect::<Vec<_>>(), vec!["pvc-1"]);
    }

    #[tokio::test]
    async fn test_get_replicas_skips_snapshots_and_foreign_vgs() {
        let lvm = LvmExecutor::new(scripted());
        let replicas = lvm.get_replicas().await.unwrap();
        assert_eq!(replicas.keys().collect::<Vec<_>>(), vec!["pvc-1"]);

        let r = &replicas["pvc-1"];
        assert_eq!(r.allocated_bytes(), 1 << 30);
        assert_eq!(r.storage_path(), "/dev/LocalStorage_PoolHDD/pvc-1");
        assert_eq!(r.state(), State::Ready);
        assert_eq!(r.status.as_ref().unwrap().disks, vec!["/dev/sdb".to_string()]);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let exec = scripted();
        exec.on(
            "lvcreate ",
            ExecResult::failed(5, "Logical Volume \"pvc-1\" already exists in volume group"),
        );
        let lvm = LvmExecutor::new(exec.clone());

        let first = lvm.create_volume_replica(&replica("pvc-1", 1 << 30)).await.unwrap();
        let second = lvm.create_volume_replica(&replica("pvc-1", 1 << 30)).await.unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.allocated_bytes(), 1 << 30);

        let calls = exec.calls_matching("lvcreate");
        assert_eq!(
            calls[0],
            "lvcreate --size 1073741824B --stripes 1 LocalStorage_PoolHDD -n pvc-1 -y"
        );
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let exec = scripted();
        exec.on("lvcreate ", ExecResult::failed(5, "Insufficient free space"));
        let lvm = LvmExecutor::new(exec);
        assert_matches!(
            lvm.create_volume_replica(&replica("pvc-1", 1 << 30)).await,
            Err(Error::Command { .. })
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_volume() {
        let exec = scripted();
        exec.on(
            "lvremove ",
            ExecResult::failed(5, "Failed to find logical volume \"LocalStorage_PoolHDD/pvc-9\""),
        );
        let lvm = LvmExecutor::new(exec);
        let mut r = replica("pvc-9", 1 << 30);
        r.status_mut().storage_path = "/dev/LocalStorage_PoolHDD/pvc-9".into();
        lvm.delete_volume_replica(&r).await.unwrap();
        lvm.delete_volume_replica(&r).await.unwrap();
    }

    #[tokio::test]
    async fn test_expand_uses_storage_path() {
        let exec = scripted();
        let lvm = LvmExecutor::new(exec.clone());
        let mut r = replica("pvc-1", 2 << 30);
        r.status_mut().dev_path = "/dev/LocalStorage_PoolHDD/pvc-1".into();
        r.status_mut().allocated_capacity_bytes = 1 << 30;

        lvm.expand_volume_replica(&r, 2 << 30).await.unwrap();
        assert_eq!(
            exec.calls_matching("lvextend"),
            vec!["lvextend --size 2147483648b /dev/LocalStorage_PoolHDD/pvc-1 -y".to_string()]
        );
    }

    #[tokio::test]
    async fn test_extend_pools_admits_new_disks_once() {
        let exec = scripted();
        let lvm = LvmExecutor::new(exec.clone());
        let disks = vec![
            LocalDevice {
                dev_path: "/dev/sdb".into(),
                class: "HDD".into(),
                ..Default::default()
            },
            LocalDevice {
                dev_path: "/dev/sdf".into(),
                class: "HDD".into(),
                ..Default::default()
            },
            LocalDevice {
                dev_path: "/dev/nvme0n1".into(),
                class: "NVMe".into(),
                ..Default::default()
            },
            LocalDevice {
                dev_path: "/dev/mapper/x".into(),
                class: "HDD".into(),
                ..Default::default()
            },
        ];

        assert!(lvm.extend_pools(&disks).await.unwrap());
        assert_eq!(
            exec.calls_matching("vgextend"),
            vec!["vgextend LocalStorage_PoolHDD -y /dev/sdf".to_string()]
        );
        assert_eq!(
            exec.calls_matching("vgcreate"),
            vec!["vgcreate LocalStorage_PoolNVMe -y /dev/nvme0n1".to_string()]
        );

        // only already-registered disks: nothing to do
        assert!(!lvm.extend_pools(&disks[..1]).await.unwrap());
    }

    #[tokio::test]
    async fn test_consistency_check() {
        let lvm = LvmExecutor::new(scripted());
        let mut declared = BTreeMap::new();
        let mut r = replica("pvc-1", 1 << 30);
        r.status_mut().storage_path = "/dev/LocalStorage_PoolHDD/pvc-1".into();
        r.status_mut().allocated_capacity_bytes = 2 << 30;
        declared.insert("pvc-1".to_string(), r);
        declared.insert("pvc-2".to_string(), replica("pvc-2", 1 << 30));

        let found = lvm.consistency_check(&declared).await.unwrap();
        assert!(found.contains(&Inconsistency::NotFoundOnHost {
            volume: "pvc-2".into()
        }));
        assert!(found
            .iter()
            .any(|i| matches!(i, Inconsistency::Capacity { volume, .. } if volume == "pvc-1")));
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_commands() {
        let exec = scripted();
        let lvm = LvmExecutor::new(exec.clone());
        let snap = LocalVolumeReplicaSnapshot::new(
            "snap1-abcdef",
            crate::crd::LocalVolumeReplicaSnapshotSpec {
                node_name: "n1".into(),
                source_volume: "pvc-1".into(),
                pool_name: "LocalStorage_PoolHDD".into(),
                volume_snapshot_name: "snap1".into(),
                required_capacity_bytes: 1 << 30,
                ..Default::default()
            },
        );

        lvm.create_snapshot(&snap).await.unwrap();
        assert_eq!(
            exec.calls_matching("lvcreate"),
            vec!["lvcreate --snapshot --name snap1 --permission r --size 1073741824B LocalStorage_PoolHDD/pvc-1".to_string()]
        );

        let status = lvm.get_snapshot(&snap).await.unwrap();
        assert_eq!(status.state, State::Ready);
        assert!(!status.attr.invalid);
        assert!(!status.attr.merging);
        assert!(status.creation_timestamp.is_some());

        lvm.rollback_snapshot("LocalStorage_PoolHDD", "snap1").await.unwrap();
        assert_eq!(
            exec.calls_matching("lvconvert"),
            vec!["lvconvert --merge LocalStorage_PoolHDD/snap1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_snapshot_of_missing_source() {
        let lvm = LvmExecutor::new(scripted());
        let snap = LocalVolumeReplicaSnapshot::new(
            "snap2-abcdef",
            crate::crd::LocalVolumeReplicaSnapshotSpec {
                source_volume: "pvc-404".into(),
                volume_snapshot_name: "snap2".into(),
                ..Default::default()
            },
        );
        assert_matches!(lvm.create_snapshot(&snap).await, Err(Error::ReplicaNotFound(_)));
        assert_matches!(lvm.get_snapshot(&snap).await, Err(Error::SnapshotNotFound(_)));
    }

    #[test]
    fn test_parse_lv_time() {
        let t = parse_lv_time("2024-03-01 10:20:30 +0800").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-03-01T02:20:30+00:00");
        assert!(parse_lv_time("2024-03-01T02:20:30Z").is_some());
        assert!(parse_lv_time("yesterday").is_none());
    }

    #[test]
    fn test_parse_lvdisplay() {
        let status = parse_lvdisplay(LVDISPLAY);
        assert_eq!(status.state, State::Ready);
        assert_eq!(status.disks, vec!["/dev/sdb".to_string()]);

        let status = parse_lvdisplay("  LV Status              NOT available\n");
        assert_eq!(status.state, State::NotReady);
    }
}
