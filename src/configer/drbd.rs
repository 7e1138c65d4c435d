//! DRBD replication
//!
//! One resource per HA volume, named after the volume. Resource `n` uses
//! port and minor `start_port + n`. State comes from a long-running
//! `drbdsetup events2 all` stream folded into a [`ResourceCache`].

use super::events::{Event, ResourceCache, CONNECTION_CONNECTED, DISK_DISKLESS, DISK_UP_TO_DATE};
use super::{Configurer, StatusSyncFn};
use crate::config::DrbdConfig;
use crate::crd::{HAState, LocalVolumeReplica, VolumeConfig};
use crate::error::{Error, Result};
use crate::exec::{CommandExecutor, ExecParams};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DRBDADM: &str = "drbdadm";
const DRBDSETUP: &str = "drbdsetup";
const DRBDMETA: &str = "drbdmeta";
const CONFIG_SUFFIX: &str = "res";

/// Pause before re-spawning a dead event stream
const MONITOR_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Rendered resource parameters
#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceConfig {
    name: String,
    port: i64,
    minor: i64,
    disk: String,
    peers: Vec<crate::crd::VolumeReplicaConfig>,
}

impl ResourceConfig {
    fn render(&self) -> String {
        let mut out = format!(
            "resource {} {{\n\n  net {{\n    protocol C;\n  }}\n",
            self.name
        );
        for peer in &self.peers {
            out.push_str(&format!(
                "\n  on {} {{\n    device    minor {};\n    disk      {};\n    address   {}:{};\n    meta-disk internal;\n    node-id {};\n  }}\n",
                peer.hostname, self.minor, self.disk, peer.ip, self.port, peer.id
            ));
        }
        let hosts: Vec<&str> = self.peers.iter().map(|p| p.hostname.as_str()).collect();
        out.push_str(&format!(
            "\n  connection-mesh {{\n    hosts {};\n  }}\n}}\n",
            hosts.join(" ")
        ));
        out
    }
}

/// State shared with the event monitor task
struct MonitorState {
    cache: ResourceCache,
    /// Resource name to replica name, for resources this node manages
    resource_replicas: DashMap<String, String>,
    sync: StatusSyncFn,
}

impl MonitorState {
    fn handle_line(&self, line: &str) {
        let Some(event) = Event::parse(line.trim()) else {
            debug!(event = %line, "Ignoring event line");
            return;
        };
        let Some(resource) = self.cache.apply(&event) else {
            return;
        };
        // unmanaged resources are tracked but never reported
        if let Some(replica) = self.resource_replicas.get(&resource) {
            (self.sync)(replica.value());
        }
    }

    async fn monitor(self: Arc<Self>, exec: Arc<dyn CommandExecutor>, stop: CancellationToken) {
        info!("Starting DRBD resource monitor");
        loop {
            let params = ExecParams::new(DRBDSETUP, ["events2", "all"]);
            match exec.stream_lines(params).await {
                Ok(mut lines) => loop {
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        line = lines.next() => match line {
                            Some(Ok(line)) => self.handle_line(&line),
                            Some(Err(e)) => {
                                error!(error = %e, "DRBD event stream failed");
                                break;
                            }
                            None => break,
                        },
                    }
                },
                Err(e) => error!(error = %e, "Failed to start DRBD event stream"),
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(MONITOR_RESTART_DELAY) => {}
            }
        }
    }
}

pub struct DrbdConfigurer {
    hostname: String,
    config: DrbdConfig,
    exec: Arc<dyn CommandExecutor>,
    state: Arc<MonitorState>,
    /// Last applied config per replica name
    local_configs: DashMap<String, VolumeConfig>,
    monitor_started: AtomicBool,
    stop: Mutex<CancellationToken>,
}

impl DrbdConfigurer {
    pub fn new(
        hostname: &str,
        config: DrbdConfig,
        exec: Arc<dyn CommandExecutor>,
        sync: StatusSyncFn,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            config,
            exec,
            state: Arc::new(MonitorState {
                cache: ResourceCache::new(),
                resource_replicas: DashMap::new(),
                sync,
            }),
            local_configs: DashMap::new(),
            monitor_started: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
        }
    }

    /// Spawn the event monitor on first use
    pub fn ensure_monitor_started(&self) {
        if self
            .monitor_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let stop = self.stop.lock().clone();
        tokio::spawn(self.state.clone().monitor(self.exec.clone(), stop));
    }

    pub fn is_primary(&self, config: &VolumeConfig) -> bool {
        config
            .replicas
            .iter()
            .any(|peer| peer.hostname == self.hostname && peer.primary)
    }

    /// Resource name of a replica
    pub fn resource_name(replica: &LocalVolumeReplica) -> &str {
        &replica.spec.volume_name
    }

    fn config_path(&self, resource: &str) -> PathBuf {
        self.config
            .config_dir
            .join(format!("{}.{}", resource, CONFIG_SUFFIX))
    }

    fn resource_config(&self, replica: &LocalVolumeReplica, config: &VolumeConfig) -> ResourceConfig {
        let port = config.resource_id + self.config.start_port as i64;
        ResourceConfig {
            name: Self::resource_name(replica).to_string(),
            port,
            minor: port,
            disk: replica.storage_path().to_string(),
            peers: config.replicas.clone(),
        }
    }

    async fn drbdadm(&self, args: &[&str]) -> Result<String> {
        let result = self
            .exec
            .run_checked(ExecParams::new(DRBDADM, args.iter().copied()))
            .await?;
        Ok(result.stdout)
    }

    /// Local disk state, ignoring peer states after the `/`
    async fn disk_state(&self, resource: &str) -> Result<String> {
        let out = self.drbdadm(&["dstate", resource]).await?;
        Ok(out
            .trim()
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string())
    }

    async fn has_metadata(&self, minor: i64, disk: &str) -> Result<bool> {
        let minor = minor.to_string();
        let params = ExecParams::new(
            DRBDMETA,
            [minor.as_str(), "v09", disk, "internal", "get-gi", "--node-id", "0", "--force"],
        );
        Ok(self.exec.run(params).await?.success())
    }

    async fn all_peers_connected(&self, resource: &str) -> Result<bool> {
        let out = self.drbdadm(&["cstate", resource]).await?;
        // a single-replica resource prints nothing
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .all(|state| state == CONNECTION_CONNECTED))
    }

    async fn ensure_symlink(&self, link: &Path, target: &str) -> Result<()> {
        match tokio::fs::symlink_metadata(link).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink(target, link).await?;
        debug!(link = %link.display(), target, "Created HA device link");
        Ok(())
    }
}

#[async_trait]
impl Configurer for DrbdConfigurer {
    async fn run(&self, stop: CancellationToken) -> Result<()> {
        *self.stop.lock() = stop;
        tokio::fs::create_dir_all(&self.config.config_dir)
            .await
            .map_err(|e| {
                Error::Configuration(format!(
                    "cannot create {}: {}",
                    self.config.config_dir.display(),
                    e
                ))
            })
    }

    fn has_config(&self, replica: &LocalVolumeReplica) -> bool {
        self.state.cache.contains(Self::resource_name(replica))
    }

    fn is_config_updated(&self, replica: &LocalVolumeReplica, config: &VolumeConfig) -> bool {
        let name = replica.metadata.name.as_deref().unwrap_or_default();
        match self.local_configs.get(name) {
            Some(applied) => applied.value() != config,
            None => true,
        }
    }

    async fn ensure_config(
        &self,
        replica: &LocalVolumeReplica,
        config: &VolumeConfig,
    ) -> Result<()> {
        let replica_name = replica.metadata.name.clone().unwrap_or_default();
        info!(replica = %replica_name, version = config.version, "Applying replication config");
        self.ensure_monitor_started();

        let conf = self.resource_config(replica, config);
        tokio::fs::create_dir_all(&self.config.config_dir).await?;
        tokio::fs::write(self.config_path(&conf.name), conf.render()).await?;

        // metadata is only checked while the disk is detached
        let detached = match self.disk_state(&conf.name).await {
            Ok(state) => state == DISK_DISKLESS,
            Err(e) => {
                debug!(resource = %conf.name, error = %e, "Disk state unavailable");
                true
            }
        };
        if detached && !self.has_metadata(conf.minor, &conf.disk).await? {
            let max_peers = self.config.max_peers.to_string();
            self.drbdadm(&["create-md", &conf.name, "--max-peers", &max_peers, "--force"])
                .await?;
        }

        self.drbdadm(&["adjust", &conf.name]).await?;

        let link = replica
            .status
            .as_ref()
            .map(|s| s.dev_path.as_str())
            .unwrap_or_default();
        if !link.is_empty() && link != conf.disk {
            let target = format!("{}{}", self.config.device_prefix, conf.minor);
            self.ensure_symlink(Path::new(link), &target).await?;
        }

        self.drbdadm(&["resize", &conf.name]).await?;

        self.local_configs.insert(replica_name.clone(), config.clone());
        self.state
            .resource_replicas
            .insert(conf.name, replica_name);
        Ok(())
    }

    async fn initialize(&self, replica: &LocalVolumeReplica, _config: &VolumeConfig) -> Result<()> {
        let resource = Self::resource_name(replica);
        info!(resource, "Initializing replicated volume");

        if self.disk_state(resource).await? == DISK_UP_TO_DATE {
            info!(resource, "Device already up to date, skipping initialization");
            return Ok(());
        }
        if !self.all_peers_connected(resource).await? {
            return Err(Error::NotConnected {
                resource: resource.to_string(),
                state: "waiting for peers".to_string(),
            });
        }
        // a new current UUID with a cleared bitmap skips the full resync
        self.drbdadm(&["new-current-uuid", resource, "--clear-bitmap"])
            .await?;
        Ok(())
    }

    async fn delete_config(&self, replica: &LocalVolumeReplica) -> Result<()> {
        let resource = Self::resource_name(replica).to_string();
        info!(resource = %resource, "Deleting replication config");

        let shown = self
            .exec
            .run(ExecParams::new(DRBDSETUP, ["show", resource.as_str()]))
            .await?;
        if shown.success() && !shown.stdout.trim().is_empty() {
            self.drbdadm(&["down", &resource]).await?;
            self.drbdadm(&["wipe-md", &resource, "--force"]).await?;
        }

        if let Some(link) = replica.status.as_ref().map(|s| s.dev_path.as_str()) {
            match tokio::fs::symlink_metadata(link).await {
                Ok(meta) if meta.file_type().is_symlink() => tokio::fs::remove_file(link).await?,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match tokio::fs::remove_file(self.config_path(&resource)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(name) = replica.metadata.name.as_deref() {
            self.local_configs.remove(name);
        }
        self.state.cache.remove(&resource);
        self.state.resource_replicas.remove(&resource);
        Ok(())
    }

    fn get_replica_ha_state(&self, replica: &LocalVolumeReplica) -> Result<HAState> {
        self.state
            .cache
            .get(Self::resource_name(replica))
            .map(|r| r.ha_state())
            .ok_or_else(|| {
                Error::Internal(format!(
                    "replica {} not found in replication cache",
                    replica.metadata.name.as_deref().unwrap_or_default()
                ))
            })
    }

    async fn consistency_check(&self, replicas: &[LocalVolumeReplica]) {
        debug!("Checking replication configs");
        let pattern = self.config.config_dir.join(format!("*.{}", CONFIG_SUFFIX));
        let paths = match glob::glob(&pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                error!(error = %e, "Invalid config pattern");
                return;
            }
        };

        for path in paths.flatten() {
            let Some(resource) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if replicas.iter().any(|r| Self::resource_name(r) == resource) {
                continue;
            }
            info!(resource, "Removing unmanaged replication config");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove replication config");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LocalVolumeReplicaSpec, VolumeReplicaConfig};
    use crate::exec::testing::ScriptedExecutor;
    use crate::exec::ExecResult;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<ScriptedExecutor>, Arc<Mutex<Vec<String>>>, DrbdConfigurer) {
        let dir = TempDir::new().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let synced = Arc::new(Mutex::new(Vec::new()));
        let sink = synced.clone();
        let configurer = DrbdConfigurer::new(
            "n1",
            DrbdConfig {
                config_dir: dir.path().join("drbd.d"),
                ..Default::default()
            },
            exec.clone(),
            Arc::new(move |name: &str| sink.lock().push(name.to_string())),
        );
        (dir, exec, synced, configurer)
    }

    fn replica(dir: &Path, volume: &str) -> LocalVolumeReplica {
        let mut r = LocalVolumeReplica::new(
            &format!("{}-abcdef", volume),
            LocalVolumeReplicaSpec {
                volume_name: volume.into(),
                pool_name: "LocalStorage_PoolHDD".into(),
                node_name: "n1".into(),
                ..Default::default()
            },
        );
        let status = r.status_mut();
        status.storage_path = format!("/dev/LocalStorage_PoolHDD/{}", volume);
        status.dev_path = dir
            .join("LocalStorage_PoolHDD-HA")
            .join(volume)
            .to_string_lossy()
            .into_owned();
        r
    }

    fn volume_config() -> VolumeConfig {
        VolumeConfig {
            version: 1,
            volume_name: "pvc-1".into(),
            convertible: true,
            resource_id: 0,
            replicas: vec![
                VolumeReplicaConfig {
                    id: 0,
                    hostname: "n1".into(),
                    ip: "10.0.0.1".into(),
                    primary: true,
                },
                VolumeReplicaConfig {
                    id: 1,
                    hostname: "n2".into(),
                    ip: "10.0.0.2".into(),
                    primary: false,
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_config_is_idempotent() {
        let (dir, exec, _, configurer) = setup();
        exec.on("drbdadm dstate", ExecResult::ok("Diskless/DUnknown\n"))
            .on("drbdmeta ", ExecResult::failed(255, "no valid meta data"));
        let r = replica(dir.path(), "pvc-1");
        let config = volume_config();

        assert!(configurer.is_config_updated(&r, &config));
        configurer.ensure_config(&r, &config).await.unwrap();
        let path = dir.path().join("drbd.d/pvc-1.res");
        let first = std::fs::read_to_string(&path).unwrap();
        configurer.ensure_config(&r, &config).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert!(!configurer.is_config_updated(&r, &config));

        assert!(first.contains("resource pvc-1 {"));
        assert!(first.contains("address   10.0.0.2:43001;"));
        assert!(first.contains("device    minor 43001;"));
        assert!(first.contains("hosts n1 n2;"));

        assert_eq!(
            exec.calls_matching("drbdadm create-md"),
            vec!["drbdadm create-md pvc-1 --max-peers 7 --force".to_string(); 2]
        );
        assert_eq!(exec.calls_matching("drbdadm adjust").len(), 2);

        let link = std::fs::read_link(r.status.as_ref().unwrap().dev_path.clone()).unwrap();
        assert_eq!(link, PathBuf::from("/dev/drbd43001"));
    }

    #[tokio::test]
    async fn test_attached_disk_skips_metadata() {
        let (dir, exec, _, configurer) = setup();
        exec.on("drbdadm dstate", ExecResult::ok("UpToDate/UpToDate\n"));
        configurer
            .ensure_config(&replica(dir.path(), "pvc-1"), &volume_config())
            .await
            .unwrap();
        assert!(exec.calls_matching("drbdmeta").is_empty());
        assert!(exec.calls_matching("drbdadm create-md").is_empty());
    }

    #[tokio::test]
    async fn test_initialize_waits_for_peers() {
        let (dir, exec, _, configurer) = setup();
        let r = replica(dir.path(), "pvc-1");
        exec.on("drbdadm dstate", ExecResult::ok("Inconsistent/Inconsistent\n"))
            .on_once("drbdadm cstate", ExecResult::ok("Connecting\n"))
            .on("drbdadm cstate", ExecResult::ok("Connected\n"));

        assert_matches!(
            configurer.initialize(&r, &volume_config()).await,
            Err(Error::NotConnected { .. })
        );
        configurer.initialize(&r, &volume_config()).await.unwrap();
        assert_eq!(
            exec.calls_matching("drbdadm new-current-uuid"),
            vec!["drbdadm new-current-uuid pvc-1 --clear-bitmap".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_config_cleans_up() {
        let (dir, exec, _, configurer) = setup();
        exec.on("drbdadm dstate", ExecResult::ok("UpToDate\n"))
            .on("drbdsetup show", ExecResult::ok("resource pvc-1 {}\n"));
        let r = replica(dir.path(), "pvc-1");
        configurer.ensure_config(&r, &volume_config()).await.unwrap();

        configurer.delete_config(&r).await.unwrap();
        assert!(!dir.path().join("drbd.d/pvc-1.res").exists());
        assert!(std::fs::symlink_metadata(&r.status.as_ref().unwrap().dev_path).is_err());
        assert_eq!(exec.calls_matching("drbdadm down").len(), 1);
        assert_eq!(exec.calls_matching("drbdadm wipe-md").len(), 1);

        // nothing left to remove
        configurer.delete_config(&r).await.unwrap();
    }

    #[tokio::test]
    async fn test_events_update_ha_state_and_notify() {
        let (dir, exec, synced, configurer) = setup();
        exec.on("drbdadm dstate", ExecResult::ok("UpToDate\n"));
        let r = replica(dir.path(), "pvc-1");
        assert!(configurer.get_replica_ha_state(&r).is_err());

        configurer.ensure_config(&r, &volume_config()).await.unwrap();
        configurer
            .state
            .handle_line("change device name:pvc-1 volume:0 minor:43001 disk:UpToDate");
        configurer
            .state
            .handle_line("change device name:other volume:0 minor:43002 disk:Outdated");

        assert!(configurer.has_config(&r));
        assert_eq!(
            configurer.get_replica_ha_state(&r).unwrap().state,
            crate::crd::HAStateKind::Consistent
        );
        assert_eq!(synced.lock().clone(), vec!["pvc-1-abcdef".to_string()]);
    }

    #[tokio::test]
    async fn test_consistency_check_removes_unknown_configs() {
        let (dir, _, _, configurer) = setup();
        let conf_dir = dir.path().join("drbd.d");
        std::fs::create_dir_all(&conf_dir).unwrap();
        std::fs::write(conf_dir.join("pvc-1.res"), "").unwrap();
        std::fs::write(conf_dir.join("stale.res"), "").unwrap();
        std::fs::write(conf_dir.join("global.conf"), "").unwrap();

        configurer
            .consistency_check(&[replica(dir.path(), "pvc-1")])
            .await;
        assert!(conf_dir.join("pvc-1.res").exists());
        assert!(!conf_dir.join("stale.res").exists());
        assert!(conf_dir.join("global.conf").exists());
    }

    #[test]
    fn test_is_primary() {
        let (_dir, _, _, configurer) = setup();
        let mut config = volume_config();
        assert!(configurer.is_primary(&config));
        config.replicas[0].primary = false;
        assert!(!configurer.is_primary(&config));
    }
}
