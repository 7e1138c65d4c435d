//! Node manager
//!
//! Owns one task queue and one worker per object kind. Informers feed the
//! queues; each worker drains its queue serially, so a given key is never
//! reconciled by two tasks at once.

use super::config_manager::ConfigManager;
use super::keys;
use crate::config::{NodeConfig, NodeManagerOptions};
use crate::crd::LocalVolumeReplica;
use crate::error::{ErrorAction, Result};
use crate::exec::CommandExecutor;
use crate::metrics;
use crate::qos::VolumeQoSManager;
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::storage::LocalManager;
use crate::store::Stores;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

// queue names double as metric labels
pub(super) const VOLUME_KIND: &str = "LocalVolume";
pub(super) const REPLICA_KIND: &str = "LocalVolumeReplica";
pub(super) const VOLUME_SNAPSHOT_KIND: &str = "LocalVolumeSnapshot";
pub(super) const REPLICA_SNAPSHOT_KIND: &str = "LocalVolumeReplicaSnapshot";
pub(super) const RESTORE_KIND: &str = "LocalVolumeReplicaSnapshotRestore";
pub(super) const DISK_CLAIM_KIND: &str = "LocalDiskClaim";
pub(super) const DISK_KIND: &str = "LocalDisk";
pub(super) const DATA_COPY_KIND: &str = "DataCopyVolumeMount";

pub(super) struct Queues {
    pub volume: Arc<TaskQueue>,
    pub replica: Arc<TaskQueue>,
    pub volume_snapshot: Arc<TaskQueue>,
    pub replica_snapshot: Arc<TaskQueue>,
    pub snapshot_restore: Arc<TaskQueue>,
    pub disk_claim: Arc<TaskQueue>,
    pub disk: Arc<TaskQueue>,
    pub data_copy: Arc<TaskQueue>,
}

impl Queues {
    fn new(max_replica_retries: u32) -> Self {
        let default = TaskQueueConfig::default;
        Self {
            volume: TaskQueue::new(VOLUME_KIND, default()),
            replica: TaskQueue::new(
                REPLICA_KIND,
                TaskQueueConfig {
                    max_retries: max_replica_retries,
                    ..default()
                },
            ),
            volume_snapshot: TaskQueue::new(VOLUME_SNAPSHOT_KIND, default()),
            replica_snapshot: TaskQueue::new(REPLICA_SNAPSHOT_KIND, default()),
            snapshot_restore: TaskQueue::new(RESTORE_KIND, default()),
            disk_claim: TaskQueue::new(DISK_CLAIM_KIND, default()),
            disk: TaskQueue::new(DISK_KIND, default()),
            data_copy: TaskQueue::new(DATA_COPY_KIND, default()),
        }
    }

    fn all(&self) -> [&Arc<TaskQueue>; 8] {
        [
            &self.volume,
            &self.replica,
            &self.volume_snapshot,
            &self.replica_snapshot,
            &self.snapshot_restore,
            &self.disk_claim,
            &self.disk,
            &self.data_copy,
        ]
    }
}

/// Objects this node created, so that each is created only once
#[derive(Debug, Default)]
pub(super) struct Records {
    /// volume name -> replica name
    pub replicas: HashMap<String, String>,
    /// volume snapshot name -> replica snapshot name
    pub replica_snapshots: HashMap<String, String>,
}

pub struct NodeManager {
    pub(super) name: String,
    pub(super) options: NodeManagerOptions,
    pub(super) stores: Stores,
    pub(super) exec: Arc<dyn CommandExecutor>,
    pub(super) storage: LocalManager,
    pub(super) config_manager: ConfigManager,
    pub(super) qos: VolumeQoSManager,
    pub(super) queues: Queues,
    pub(super) records: Mutex<Records>,
}

impl NodeManager {
    pub fn new(
        options: NodeManagerOptions,
        stores: Stores,
        exec: Arc<dyn CommandExecutor>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let config_manager =
            ConfigManager::new(&options.node_name, &options.system, exec.clone(), &stores);
        let qos = VolumeQoSManager::new(&options.system.cgroup_root, exec.clone());
        Ok(Self::with_parts(options, stores, exec, config_manager, qos))
    }

    pub(crate) fn with_parts(
        options: NodeManagerOptions,
        stores: Stores,
        exec: Arc<dyn CommandExecutor>,
        config_manager: ConfigManager,
        qos: VolumeQoSManager,
    ) -> Arc<Self> {
        let name = options.node_name.clone();
        let storage = LocalManager::new(
            NodeConfig {
                name: name.clone(),
                ..Default::default()
            },
            exec.clone(),
            &stores,
            options.system.restore_timeout(),
        );
        Arc::new(Self {
            queues: Queues::new(options.system.max_replica_retries),
            name,
            options,
            stores,
            exec,
            storage,
            config_manager,
            qos,
            records: Mutex::new(Records::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local storage of this node
    pub fn storage(&self) -> &LocalManager {
        &self.storage
    }

    /// Hand a volume to this node's volume worker
    pub fn take_volume_replica_task_assignment(&self, volume: &str) {
        debug!(volume = %volume, "Taking volume replica task assignment");
        self.queues.volume.add(volume);
    }

    /// Re-check a replica owned by this node
    pub fn reconcile_volume_replica(&self, replica: &LocalVolumeReplica) {
        if replica.spec.node_name != self.name {
            return;
        }
        if let Some(name) = replica.metadata.name.as_deref() {
            self.queues.replica.add(name);
        }
    }

    /// Register the node and serve until `stop` fires or a watch fails
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        info!(node = %self.name, "Starting node manager");

        keys::ensure_authorized_keys(&self.options.system.authorized_keys_path)?;
        self.init_records().await?;
        self.register().await?;
        self.config_manager.run(stop.clone()).await?;

        let mut informers = JoinSet::new();
        self.spawn_informers(&mut informers, &stop);

        let mut workers = JoinSet::new();
        self.spawn_workers(&mut workers);

        let result = tokio::select! {
            _ = stop.cancelled() => {
                info!(node = %self.name, "Stop requested, shutting down workers");
                Ok(())
            }
            Some(joined) = informers.join_next() => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(crate::error::Error::Internal(format!("informer panicked: {}", e))),
            },
        };

        stop.cancel();
        self.shutdown_queues();
        while workers.join_next().await.is_some() {}
        informers.shutdown().await;

        info!(node = %self.name, "Node manager stopped");
        result
    }

    fn shutdown_queues(&self) {
        for queue in self.queues.all() {
            queue.shutdown();
        }
        self.config_manager.sync_queue().shutdown();
    }

    /// Rebuild the volume -> replica records from this node's replicas
    async fn init_records(&self) -> Result<()> {
        let replicas = self.stores.replicas.list().await?;
        let mut records = self.records.lock().await;
        for replica in replicas.into_iter().filter(|r| r.spec.node_name == self.name) {
            if let Some(name) = replica.metadata.name {
                records.replicas.insert(replica.spec.volume_name, name);
            }
        }
        debug!(replicas = records.replicas.len(), "Initialized replica records");
        Ok(())
    }

    fn spawn_workers(self: &Arc<Self>, workers: &mut JoinSet<()>) {
        self.spawn_worker(workers, &self.queues.volume, |m, key| async move {
            m.process_volume(&key).await
        });
        self.spawn_worker(workers, &self.queues.replica, |m, key| async move {
            m.process_volume_replica(&key).await
        });
        self.spawn_worker(workers, &self.queues.volume_snapshot, |m, key| async move {
            m.process_volume_snapshot(&key).await
        });
        self.spawn_worker(workers, &self.queues.replica_snapshot, |m, key| async move {
            m.process_replica_snapshot(&key).await
        });
        self.spawn_worker(workers, &self.queues.snapshot_restore, |m, key| async move {
            m.process_snapshot_restore(&key).await
        });
        self.spawn_worker(workers, &self.queues.disk_claim, |m, key| async move {
            m.process_disk_claim(&key).await
        });
        self.spawn_worker(workers, &self.queues.disk, |m, key| async move {
            m.process_disk(&key).await
        });
        self.spawn_worker(workers, &self.queues.data_copy, |m, key| async move {
            m.process_data_copy_mount(&key).await
        });
        let sync_queue = self.config_manager.sync_queue().clone();
        self.spawn_worker(workers, &sync_queue, |m, key| async move {
            m.config_manager.sync_replica_status(&key).await
        });
    }

    fn spawn_worker<F, Fut>(
        self: &Arc<Self>,
        workers: &mut JoinSet<()>,
        queue: &Arc<TaskQueue>,
        process: F,
    ) where
        F: Fn(Arc<Self>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let this = Arc::clone(self);
        workers.spawn(run_worker(queue.clone(), move |key| {
            process(this.clone(), key)
        }));
    }
}

/// Drain `queue` until it is shut down, requeueing failures by error kind
pub(super) async fn run_worker<F, Fut>(queue: Arc<TaskQueue>, process: F)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let kind = queue.name().to_string();
    info!(worker = %kind, "Worker started");

    while let Some(key) = queue.get().await {
        let span = info_span!("reconcile", kind = %kind, key = %key);
        let result = process(key.clone()).instrument(span).await;
        metrics::record_reconcile(&kind, result.is_ok());

        match result {
            Ok(()) => {
                debug!(kind = %kind, key = %key, "Task completed");
                queue.forget(&key);
            }
            Err(e) => match e.action() {
                ErrorAction::NoRequeue => {
                    error!(kind = %kind, key = %key, error = %e, "Task failed, not retrying");
                    queue.forget(&key);
                }
                ErrorAction::RequeueAfter(delay) => {
                    info!(kind = %kind, key = %key, reason = %e, "Task waiting, retry later");
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::RequeueWithBackoff => {
                    warn!(kind = %kind, key = %key, error = %e, "Task failed, retry later");
                    queue.add_rate_limited(key.clone());
                }
            },
        }
        queue.done(&key);
        metrics::set_queue_depth(&kind, queue.len());
    }

    info!(worker = %kind, "Worker stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::crd::{LocalStorageNode, LocalStorageNodeSpec};
    use crate::error::Error;
    use crate::exec::testing::ScriptedExecutor;
    use crate::node::config_manager::tests::FakeConfigurer;
    use crate::node::config_manager::SYNC_REPLICA_STATUS_QUEUE;
    use crate::qos::VolumeCgroups;
    use crate::storage::lvm::tests::scripted;
    use crate::store::Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Manager for node `n1` over memory stores, scripted LVM and a fake configurer
    pub(crate) struct Harness {
        pub manager: Arc<NodeManager>,
        pub stores: Stores,
        pub exec: Arc<ScriptedExecutor>,
        pub configer: Arc<FakeConfigurer>,
        pub dir: tempfile::TempDir,
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(scripted()).await
    }

    pub(crate) async fn harness_with(exec: Arc<ScriptedExecutor>) -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let stores = Stores::memory();
        stores
            .storage_nodes
            .create(&LocalStorageNode::new(
                "n1",
                LocalStorageNodeSpec {
                    hostname: "n1".into(),
                    storage_ip: "10.0.0.1".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let options = NodeManagerOptions {
            node_name: "n1".into(),
            namespace: "hwameistor".into(),
            storage_ip_annotation: None,
            system: SystemConfig {
                authorized_keys_path: dir.path().join("authorized_keys"),
                mount_table: dir.path().join("mounts"),
                cgroup_root: dir.path().join("cgroup"),
                ..Default::default()
            },
        };
        std::fs::write(dir.path().join("mounts"), "").unwrap();

        let configer = Arc::new(FakeConfigurer::default());
        let config_manager = ConfigManager::with_configer(
            "n1",
            configer.clone(),
            &stores,
            TaskQueue::new(SYNC_REPLICA_STATUS_QUEUE, TaskQueueConfig::default()),
        );
        let qos = VolumeQoSManager::with_cgroups(VolumeCgroups::Noop, exec.clone());
        let manager =
            NodeManager::with_parts(options, stores.clone(), exec.clone(), config_manager, qos);
        manager.storage().registry().sync_node_resources().await.unwrap();

        Harness {
            manager,
            stores,
            exec,
            configer,
            dir,
        }
    }

    #[tokio::test]
    async fn test_worker_requeues_by_error_kind() {
        let queue = TaskQueue::new(
            "test",
            TaskQueueConfig {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(5),
                max_retries: 0,
            },
        );
        let attempts = Arc::new(AtomicUsize::new(0));

        let worker = {
            let attempts = attempts.clone();
            tokio::spawn(run_worker(queue.clone(), move |key| {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    match (key.as_str(), n) {
                        ("transient", 0) => Err(Error::Internal("boom".into())),
                        ("invalid", _) => Err(Error::Validation("bad".into())),
                        _ => Ok(()),
                    }
                }
            }))
        };

        queue.add("transient");
        tokio::time::timeout(Duration::from_secs(2), async {
            while attempts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.num_requeues("transient"), 0);

        queue.add("invalid");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.num_requeues("invalid"), 0);

        queue.shutdown();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_volume_replica_only_takes_own_replicas() {
        let h = harness().await;
        let mut replica = LocalVolumeReplica::new(
            "pvc-1-abcdef",
            crate::crd::LocalVolumeReplicaSpec {
                volume_name: "pvc-1".into(),
                node_name: "n2".into(),
                ..Default::default()
            },
        );
        h.manager.reconcile_volume_replica(&replica);
        assert!(h.manager.queues.replica.is_empty());

        replica.spec.node_name = "n1".into();
        h.manager.reconcile_volume_replica(&replica);
        assert_eq!(h.manager.queues.replica.len(), 1);

        h.manager.take_volume_replica_task_assignment("pvc-1");
        assert_eq!(h.manager.queues.volume.len(), 1);
    }

    #[tokio::test]
    async fn test_init_records_from_own_replicas() {
        let h = harness().await;
        for (name, volume, node) in [("a-1", "a", "n1"), ("b-1", "b", "n2")] {
            h.stores
                .replicas
                .create(&LocalVolumeReplica::new(
                    name,
                    crate::crd::LocalVolumeReplicaSpec {
                        volume_name: volume.into(),
                        node_name: node.into(),
                        ..Default::default()
                    },
                ))
                .await
                .unwrap();
        }
        h.manager.init_records().await.unwrap();
        let records = h.manager.records.lock().await;
        assert_eq!(records.replicas.len(), 1);
        assert_eq!(records.replicas["a"], "a-1");
    }

    #[tokio::test]
    async fn test_run_drives_assigned_volume_to_ready() {
        use crate::crd::{LocalVolume, LocalVolumeSpec, State, VolumeConfig, VolumeReplicaConfig};

        let h = harness().await;
        h.stores
            .nodes
            .create(&crate::node::register::tests::k8s_node("n1", "10.0.0.1"))
            .await
            .unwrap();

        let stop = CancellationToken::new();
        let running = tokio::spawn(h.manager.clone().run(stop.clone()));

        h.stores
            .volumes
            .create(&LocalVolume::new(
                "pvc-1",
                LocalVolumeSpec {
                    required_capacity_bytes: 1 << 30,
                    pool_name: "LocalStorage_PoolHDD".into(),
                    replica_number: 1,
                    config: Some(VolumeConfig {
                        volume_name: "pvc-1".into(),
                        resource_id: -1,
                        replicas: vec![VolumeReplicaConfig {
                            id: 1,
                            hostname: "n1".into(),
                            primary: true,
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let replicas = h.stores.replicas.list().await.unwrap();
                if replicas
                    .iter()
                    .any(|r| r.spec.volume_name == "pvc-1" && r.state() == State::Ready)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        stop.cancel();
        running.await.unwrap().unwrap();
    }
}
