//! Mount table lookups and host mounts

use crate::error::Result;
use crate::exec::{CommandExecutor, ExecParams};
use std::path::Path;
use tracing::{debug, info};

/// Device-mapper name of a logical volume: dashes inside the names are doubled
pub fn mapper_path(pool: &str, volume: &str) -> String {
    format!(
        "/dev/mapper/{}-{}",
        pool.replace('-', "--"),
        volume.replace('-', "--")
    )
}

/// Mount points of the logical volume `<pool>/<volume>`.
///
/// LVM devices show up either as `/dev/<vg>/<lv>` or under `/dev/mapper`.
pub async fn volume_mount_points(
    mount_table: &Path,
    pool: &str,
    volume: &str,
) -> Result<Vec<String>> {
    let table = tokio::fs::read_to_string(mount_table).await?;
    let lv_path = format!("/dev/{}/{}", pool, volume);
    let mapper = mapper_path(pool, volume);

    Ok(table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            (device == lv_path || device == mapper).then(|| mount_point.to_string())
        })
        .collect())
}

/// Mount `device` at `mount_point`, creating a `fs_type` filesystem when the
/// device carries none yet
pub async fn format_and_mount(
    exec: &dyn CommandExecutor,
    device: &str,
    mount_point: &str,
    fs_type: &str,
) -> Result<()> {
    // blkid exits non-zero on a blank device
    let blkid = exec
        .run(ExecParams::new("blkid", ["-o", "value", "-s", "TYPE", device]))
        .await?;
    let existing = blkid.stdout.trim();
    if existing.is_empty() {
        info!(device = %device, fs_type = %fs_type, "Formatting device");
        exec.run_checked(ExecParams::new(&format!("mkfs.{}", fs_type), [device]))
            .await?;
    } else {
        debug!(device = %device, fs_type = %existing, "Device already formatted");
    }

    exec.run_checked(ExecParams::new("mkdir", ["-p", mount_point]))
        .await?;
    exec.run_checked(ExecParams::new("mount", ["-t", fs_type, device, mount_point]))
        .await?;
    info!(device = %device, mount_point = %mount_point, "Mounted device");
    Ok(())
}

/// Unmount `mount_point`; a path that is not mounted is left alone
pub async fn unmount(exec: &dyn CommandExecutor, mount_point: &str) -> Result<()> {
    let params = ExecParams::new("umount", [mount_point]);
    let result = exec.run(params.clone()).await?;
    if result.success() {
        info!(mount_point = %mount_point, "Unmounted");
        return Ok(());
    }
    if result.stderr.contains("not mounted") || result.stderr.contains("No such file") {
        debug!(mount_point = %mount_point, "Nothing mounted");
        return Ok(());
    }
    result.check(&params).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExecutor;
    use crate::exec::ExecResult;
    use std::io::Write;

    const MOUNTS: &str = "\
/dev/sda2 / xfs rw,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
/dev/mapper/LocalStorage_PoolHDD-pvc--1 /var/lib/kubelet/pods/a/volumes/mount ext4 rw 0 0
/dev/LocalStorage_PoolHDD/pvc-1 /mnt/pvc-1 ext4 rw 0 0
/dev/mapper/LocalStorage_PoolHDD-pvc--10 /mnt/pvc-10 ext4 rw 0 0
";

    #[tokio::test]
    async fn test_volume_mount_points() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MOUNTS.as_bytes()).unwrap();

        let points = volume_mount_points(file.path(), "LocalStorage_PoolHDD", "pvc-1")
            .await
            .unwrap();
        assert_eq!(
            points,
            vec!["/var/lib/kubelet/pods/a/volumes/mount", "/mnt/pvc-1"]
        );

        let none = volume_mount_points(file.path(), "LocalStorage_PoolHDD", "pvc-2")
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_missing_mount_table() {
        assert!(volume_mount_points(Path::new("/nonexistent/mounts"), "p", "v")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_format_and_mount_formats_blank_device_only() {
        let exec = ScriptedExecutor::new();
        exec.on("blkid ", ExecResult::failed(2, ""));
        format_and_mount(&exec, "/dev/mapper/p-v", "/mnt/v", "xfs").await.unwrap();
        assert_eq!(exec.calls_matching("mkfs.xfs"), vec!["mkfs.xfs /dev/mapper/p-v"]);
        assert_eq!(exec.calls_matching("mount "), vec!["mount -t xfs /dev/mapper/p-v /mnt/v"]);

        let exec = ScriptedExecutor::new();
        exec.on("blkid ", ExecResult::ok("ext4\n"));
        format_and_mount(&exec, "/dev/mapper/p-v", "/mnt/v", "xfs").await.unwrap();
        assert!(exec.calls_matching("mkfs").is_empty());
    }

    #[tokio::test]
    async fn test_unmount_tolerates_unmounted_path() {
        let exec = ScriptedExecutor::new();
        exec.on("umount ", ExecResult::failed(32, "umount: /mnt/v: not mounted."));
        unmount(&exec, "/mnt/v").await.unwrap();

        let exec = ScriptedExecutor::new();
        exec.on("umount ", ExecResult::failed(32, "umount: /mnt/v: target is busy."));
        assert!(unmount(&exec, "/mnt/v").await.is_err());
    }
}
