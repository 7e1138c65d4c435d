//! Byte-copy restore of a snapshot into a new volume

use crate::crd::LocalVolumeReplicaSnapshotRestore;
use crate::error::Result;
use crate::exec::{CommandExecutor, ExecParams};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const DD_TIMEOUT: Duration = Duration::from_secs(600);
const DD_BLOCK_SIZE: &str = "bs=10M";

/// `/dev/<pool>/<volume>`
pub fn pool_volume_path(pool: &str, volume: &str) -> String {
    Path::new("/dev")
        .join(pool)
        .join(volume)
        .to_string_lossy()
        .into_owned()
}

pub struct DdExecutor {
    exec: Arc<dyn CommandExecutor>,
    timeout: Duration,
}

impl DdExecutor {
    pub fn new(exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            exec,
            timeout: DD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Copy the snapshot device onto the target volume
    pub async fn restore(&self, restore: &LocalVolumeReplicaSnapshotRestore) -> Result<()> {
        let spec = &restore.spec;
        let target = pool_volume_path(&spec.target_pool_name, &spec.target_volume);
        let source = pool_volume_path(&spec.target_pool_name, &spec.source_volume_snapshot);

        let params = ExecParams::new(
            "dd",
            [
                format!("if={}", source),
                format!("of={}", target),
                DD_BLOCK_SIZE.to_string(),
            ],
        )
        .with_timeout(self.timeout);

        info!(volume = %target, snapshot = %source, "Start restoring snapshot");
        if let Err(e) = self.exec.run_checked(params).await {
            error!(volume = %target, error = %e, "Failed to restore snapshot");
            return Err(e);
        }
        info!(volume = %target, "Snapshot restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::LocalVolumeReplicaSnapshotRestoreSpec;
    use crate::error::Error;
    use crate::exec::testing::ScriptedExecutor;
    use crate::exec::ExecResult;
    use assert_matches::assert_matches;

    fn restore() -> LocalVolumeReplicaSnapshotRestore {
        LocalVolumeReplicaSnapshotRestore::new(
            "restore-1",
            LocalVolumeReplicaSnapshotRestoreSpec {
                node_name: "n1".into(),
                target_volume: "pvc-new".into(),
                target_pool_name: "LocalStorage_PoolHDD".into(),
                source_volume_snapshot: "snap1".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_restore_command() {
        let exec = Arc::new(ScriptedExecutor::new());
        DdExecutor::new(exec.clone()).restore(&restore()).await.unwrap();
        assert_eq!(
            exec.calls(),
            vec![
                "dd if=/dev/LocalStorage_PoolHDD/snap1 of=/dev/LocalStorage_PoolHDD/pvc-new bs=10M"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_failure() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.on("dd ", ExecResult::failed(1, "No space left on device"));
        assert_matches!(
            DdExecutor::new(exec).restore(&restore()).await,
            Err(Error::Command { .. })
        );
    }
}
