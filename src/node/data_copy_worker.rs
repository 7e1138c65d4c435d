//! Data-copy mounts: expose a volume's logical volume on the source and target
//! nodes while a migration job copies it, coordinated through a per-volume
//! sync config map

use super::manager::NodeManager;
use super::mount;
use crate::crd::State;
use crate::error::{Error, Result};
use crate::store::get_optional;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::{debug, info};

pub(super) const SOURCE_NODE: &str = "sourceNode";
pub(super) const TARGET_NODE: &str = "targetNode";
pub(super) const LOCAL_VOLUME: &str = "localVolume";
const SOURCE_READY: &str = "sourceReady";
const TARGET_READY: &str = "targetReady";
const SOURCE_COMPLETED: &str = "sourceCompleted";
const TARGET_COMPLETED: &str = "targetCompleted";
const SYNC_COMPLETED: &str = "syncCompleted";
const SOURCE_MOUNT_POINT: &str = "sourceMountPoint";
const TARGET_MOUNT_POINT: &str = "targetMountPoint";
const YES: &str = "yes";
const DEFAULT_FS_TYPE: &str = "xfs";

/// Which side of the copy this node plays
struct Side {
    dir: &'static str,
    ready: &'static str,
    completed: &'static str,
    mount_point: &'static str,
}

const SOURCE: Side = Side {
    dir: "src",
    ready: SOURCE_READY,
    completed: SOURCE_COMPLETED,
    mount_point: SOURCE_MOUNT_POINT,
};

const TARGET: Side = Side {
    dir: "dst",
    ready: TARGET_READY,
    completed: TARGET_COMPLETED,
    mount_point: TARGET_MOUNT_POINT,
};

fn field<'a>(config_map: &'a ConfigMap, key: &str) -> &'a str {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

fn set_field(config_map: &mut ConfigMap, key: &str, value: &str) {
    config_map
        .data
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

impl NodeManager {
    pub(super) async fn process_data_copy_mount(&self, volume_name: &str) -> Result<()> {
        let system = &self.options.system;

        let replicas: Vec<_> = self
            .stores
            .replicas
            .list()
            .await?
            .into_iter()
            .filter(|r| r.spec.volume_name == volume_name)
            .collect();
        if replicas.len() != 2 {
            return Err(Error::ReplicasNotReady {
                volume: volume_name.to_string(),
                reason: format!("expected 2 replicas, found {}", replicas.len()),
            });
        }
        if let Some(pending) = replicas.iter().find(|r| r.state() != State::Ready) {
            return Err(Error::ReplicasNotReady {
                volume: volume_name.to_string(),
                reason: format!("replica {} is {:?}", pending.spec.node_name, pending.state()),
            });
        }

        let cm_name = format!("{}-{}", system.data_copy_sync_config_map_prefix, volume_name);
        let Some(mut config_map) = get_optional(self.stores.config_maps.as_ref(), &cm_name).await?
        else {
            debug!(volume = %volume_name, config_map = %cm_name, "No sync config, nothing to mount");
            return Ok(());
        };
        let volume = self.stores.volumes.get(volume_name).await?;

        let side = if field(&config_map, SOURCE_NODE) == self.name {
            SOURCE
        } else if field(&config_map, TARGET_NODE) == self.name {
            TARGET
        } else {
            return Ok(());
        };
        let mount_point = system
            .data_copy_mount_root
            .join(side.dir)
            .join(volume_name)
            .to_string_lossy()
            .into_owned();

        if field(&config_map, SYNC_COMPLETED) == YES {
            mount::unmount(self.exec.as_ref(), &mount_point).await?;
            if field(&config_map, side.completed) != YES {
                set_field(&mut config_map, side.completed, YES);
                self.stores.config_maps.update(&config_map).await?;
            }
            info!(volume = %volume_name, mount_point = %mount_point, "Data copy finished, released mount");
            return Ok(());
        }

        let pool = &volume.spec.pool_name;
        let fs_type = volume
            .status
            .as_ref()
            .map(|s| s.published_fs_type.as_str())
            .filter(|fs| !fs.is_empty())
            .unwrap_or(DEFAULT_FS_TYPE);
        let mounted = mount::volume_mount_points(&system.mount_table, pool, volume_name).await?;
        if !mounted.iter().any(|m| *m == mount_point) {
            let device = mount::mapper_path(pool, volume_name);
            mount::format_and_mount(self.exec.as_ref(), &device, &mount_point, fs_type).await?;
        }

        if field(&config_map, side.ready) != YES {
            set_field(&mut config_map, side.ready, YES);
            set_field(&mut config_map, side.mount_point, &mount_point);
            self.stores.config_maps.update(&config_map).await?;
            info!(volume = %volume_name, mount_point = %mount_point, "Volume ready for data copy");
        }
        Ok(())
    }
}
