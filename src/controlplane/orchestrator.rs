//! Device Lifecycle Orchestrator
//!
//! Coordinates every operation that spans the topology store, the executor
//! and the allocator:
//! - Cluster and node membership
//! - Device add and delete, with compensation on partial failure
//! - Device state changes
//! - Capacity resync for a device or a whole node
//!
//! Slow work (host provisioning, teardown, size queries) runs as a background job;
//! request handlers only validate and hand off.

use super::jobs::{JobId, JobManager};
use super::metrics::{OperationMetrics, Outcome};
use super::resync::{ResyncReport, TopologyReconciler};
use super::saga::{Saga, DEFAULT_RETRY_WINDOW};
use crate::domain::ports::{DeviceAddRequest, DeviceAllocatorRef, DeviceExecutorRef, NodeAddRequest};
use crate::error::{Error, Result};
use crate::topology::{
    Bucket, ClusterEntry, ClusterInfo, DeviceEntry, DeviceInfo, DeviceState, NodeEntry, NodeInfo,
    publish, PoolChange, StoreStatsSnapshot, TopologyEvent, TopologyStore, Transaction, WriteTx,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long one failing compensation is retried
    pub compensation_retry: Duration,
    /// How long finished jobs stay queryable
    pub job_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            compensation_retry: DEFAULT_RETRY_WINDOW,
            job_retention: Duration::from_secs(3600),
        }
    }
}

// =============================================================================
// Orchestrator Status
// =============================================================================

/// Topology overview
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub clusters: usize,
    pub nodes: usize,
    pub devices: usize,
    pub pending_jobs: usize,
    pub executor: String,
    #[serde(skip)]
    pub store: StoreStatsSnapshot,
}

/// Everything a device delete needs, captured before the job starts
#[derive(Debug, Clone)]
struct DeletePlan {
    device: DeviceEntry,
    node: NodeEntry,
    cluster: ClusterEntry,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Coordinates device lifecycle operations
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<TopologyStore>,
    executor: DeviceExecutorRef,
    allocator: DeviceAllocatorRef,
    reconciler: TopologyReconciler,
    jobs: JobManager,
    metrics: Arc<OperationMetrics>,
    events: broadcast::Sender<TopologyEvent>,
    /// Orders allocator updates that follow a device commit
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<TopologyStore>,
        executor: DeviceExecutorRef,
        allocator: DeviceAllocatorRef,
        metrics: Arc<OperationMetrics>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let reconciler = TopologyReconciler::new(
            Arc::clone(&store),
            Arc::clone(&executor),
            Arc::clone(&metrics),
            events.clone(),
        );

        info!(executor = executor.name(), "Orchestrator initialized");

        Arc::new(Self {
            config,
            store,
            executor,
            allocator,
            reconciler,
            jobs: JobManager::new(),
            metrics,
            events,
            device_locks: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn metrics(&self) -> &Arc<OperationMetrics> {
        &self.metrics
    }

    /// Get a topology event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Get a topology overview
    pub fn status(&self) -> Result<OrchestratorStatus> {
        let (clusters, nodes, devices) = self.store.view(|tx| {
            Ok((
                tx.keys(Bucket::Cluster).len(),
                tx.keys(Bucket::Node).len(),
                tx.keys(Bucket::Device).len(),
            ))
        })?;

        Ok(OrchestratorStatus {
            clusters,
            nodes,
            devices,
            pending_jobs: self.jobs.pending(),
            executor: self.executor.name().to_string(),
            store: self.store.stats(),
        })
    }

    /// Drop finished jobs past their retention
    pub fn prune_jobs(&self) -> usize {
        self.jobs.prune(self.config.job_retention)
    }

    fn saga(&self, operation: &str) -> Saga {
        Saga::new(operation).with_retry_window(self.config.compensation_retry)
    }

    /// Count a request that was refused before any side effect
    fn rejected<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            debug!(operation, error = %e, "Request rejected");
            self.metrics.record_operation(operation, Outcome::Rejected);
        }
        result
    }

    /// Commit or roll back `saga` depending on `result`
    async fn settle<T>(&self, operation: &str, saga: Saga, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                saga.commit();
                self.metrics.record_operation(operation, Outcome::Succeeded);
                Ok(value)
            }
            Err(e) => {
                warn!(operation, error = %e, "Operation failed, rolling back");
                let report = saga.rollback().await;
                self.metrics
                    .record_compensations(report.succeeded, report.failed.len());
                if !report.is_clean() {
                    error!(
                        critical = true,
                        operation,
                        failed = ?report.failed,
                        "Compensation incomplete, manual cleanup may be required"
                    );
                }
                self.metrics.record_operation(operation, Outcome::Failed);
                Err(e)
            }
        }
    }

    /// Hold while committing a device change and applying its allocator effect
    async fn lock_device(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.device_locks.entry(device_id.to_string()).or_default().value());
        lock.lock_owned().await
    }

    fn consistency_fault(&self, message: String) {
        error!(critical = true, "{}", message);
        self.metrics.record_consistency_fault();
    }

    // =========================================================================
    // Clusters
    // =========================================================================

    /// Create an empty cluster
    pub fn create_cluster(&self) -> Result<ClusterInfo> {
        let cluster = ClusterEntry::new();
        self.store.update(|tx| tx.insert(&cluster))?;
        info!("Created cluster {}", cluster.id);
        self.metrics.record_operation("cluster_create", Outcome::Succeeded);
        Ok(cluster.info())
    }

    /// List cluster ids
    pub fn list_clusters(&self) -> Result<Vec<String>> {
        self.store.view(|tx| Ok(tx.keys(Bucket::Cluster)))
    }

    pub fn cluster_info(&self, cluster_id: &str) -> Result<ClusterInfo> {
        self.store
            .view(|tx| ClusterEntry::from_id(tx, cluster_id).map(|c| c.info()))
    }

    /// Delete a cluster that has no nodes
    pub fn delete_cluster(&self, cluster_id: &str) -> Result<()> {
        let result = self.store.update(|tx| {
            let cluster = ClusterEntry::from_id(tx, cluster_id)?;
            if !cluster.nodes.is_empty() {
                return Err(Error::Conflict(format!(
                    "Unable to delete cluster [{}] because it contains {} node(s)",
                    cluster.id,
                    cluster.nodes.len()
                )));
            }
            cluster.delete(tx)
        });
        self.rejected("cluster_delete", result)?;

        info!("Deleted cluster {}", cluster_id);
        self.metrics.record_operation("cluster_delete", Outcome::Succeeded);
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Add a node to a cluster
    pub fn add_node(&self, request: NodeAddRequest) -> Result<NodeInfo> {
        let result = request.validate().and_then(|_| {
            self.store.update(|tx| {
                let mut cluster = ClusterEntry::from_id(tx, &request.cluster_id)?;
                let node = NodeEntry::new(
                    cluster.id.clone(),
                    request.hostnames.clone(),
                    request.zone,
                );
                node.register(tx)?;
                cluster.node_add(&node.id);
                cluster.save(tx)?;
                node.info(tx)
            })
        });
        let info = self.rejected("node_add", result)?;

        info!(
            "Added node {} to cluster {} (zone {})",
            info.id, info.cluster_id, info.zone
        );
        self.metrics.record_operation("node_add", Outcome::Succeeded);
        Ok(info)
    }

    pub fn node_info(&self, node_id: &str) -> Result<NodeInfo> {
        self.store
            .view(|tx| NodeEntry::from_id(tx, node_id)?.info(tx))
    }

    /// Delete a node that has no devices
    pub fn delete_node(&self, node_id: &str) -> Result<()> {
        let result = self.store.update(|tx| {
            let node = NodeEntry::from_id(tx, node_id)?;
            if !node.devices.is_empty() {
                return Err(Error::Conflict(format!(
                    "Unable to delete node [{}] because it contains {} device(s)",
                    node.id,
                    node.devices.len()
                )));
            }

            match ClusterEntry::from_id(tx, &node.cluster_id) {
                Ok(mut cluster) => {
                    cluster.node_delete(&node.id);
                    cluster.save(tx)?;
                }
                Err(e) if e.is_not_found() => self.consistency_fault(format!(
                    "Cluster {} of node {} does not exist",
                    node.cluster_id, node.id
                )),
                Err(e) => return Err(e),
            }

            node.deregister(tx)
        });
        self.rejected("node_delete", result)?;

        info!("Deleted node {}", node_id);
        self.metrics.record_operation("node_delete", Outcome::Succeeded);
        Ok(())
    }

    // =========================================================================
    // Device Add
    // =========================================================================

    /// Register a device and provision it in the background
    pub fn add_device(self: &Arc<Self>, request: DeviceAddRequest) -> Result<JobId> {
        let device = DeviceEntry::new(request.name.clone(), request.node_id.clone());

        let result = request.validate().and_then(|_| {
            self.store.update(|tx| {
                NodeEntry::from_id(tx, &request.node_id)?;
                device.register(tx)
            })
        });
        self.rejected("device_add", result)?;

        info!(
            "Registered device {} ({}) on node {}",
            device.id, device.name, device.node_id
        );

        let this = Arc::clone(self);
        Ok(self
            .jobs
            .submit("device_add", move || async move {
                this.run_device_add(device).await.map(|_| None)
            }))
    }

    async fn run_device_add(&self, device: DeviceEntry) -> Result<()> {
        let mut saga = self.saga("device_add");

        let store = Arc::clone(&self.store);
        let registered = device.clone();
        saga.on_rollback("deregister device", move || {
            let store = Arc::clone(&store);
            let device = registered.clone();
            async move { store.update(|tx| device.deregister(tx)) }
        });

        let result = self.provision_device(&mut saga, device).await;
        self.settle("device_add", saga, result).await
    }

    async fn provision_device(&self, saga: &mut Saga, device: DeviceEntry) -> Result<()> {
        let host = self.store.view(|tx| {
            let node = NodeEntry::from_id(tx, &device.node_id)?;
            Ok(node.manage_hostname()?.to_string())
        })?;

        let physical = self
            .executor
            .device_setup(&host, &device.name, &device.id)
            .await?;

        {
            let executor = Arc::clone(&self.executor);
            let (name, id) = (device.name.clone(), device.id.clone());
            let host = host.clone();
            saga.on_rollback("teardown device", move || {
                let executor = Arc::clone(&executor);
                let (host, name, id) = (host.clone(), name.clone(), id.clone());
                async move { executor.device_teardown(&host, &name, &id).await }
            });
        }

        let _device_lock = self.lock_device(&device.id).await;

        // Device, node and cluster may all have changed during setup
        let (cluster, node, device) = self.store.update(|tx| {
            let mut current = DeviceEntry::from_id(tx, &device.id)?;
            if !current.is_registered(tx) {
                return Err(Error::Conflict(format!(
                    "Device {} lost its registration on node {} during setup",
                    current.id, current.node_id
                )));
            }
            let mut node = NodeEntry::from_id(tx, &current.node_id)?;
            let cluster = ClusterEntry::from_id(tx, &node.cluster_id)?;

            current.storage_set(physical.size);
            current.set_extent_size(physical.extent_size);
            node.device_add(&current.id);
            node.save(tx)?;
            current.save(tx)?;
            Ok((cluster, node, current))
        })?;

        {
            let store = Arc::clone(&self.store);
            let (node_id, device_id) = (node.id.clone(), device.id.clone());
            saga.on_rollback("unlink device from node", move || {
                let store = Arc::clone(&store);
                let (node_id, device_id) = (node_id.clone(), device_id.clone());
                async move { store.update(|tx| unlink_device(tx, &node_id, &device_id)) }
            });
        }

        self.allocator.add_device(&cluster, &node, &device).await?;

        info!(
            "Added device {} ({}) to node {}: {} bytes",
            device.id, device.name, node.id, device.storage.total
        );
        publish(&self.events, TopologyEvent::DeviceAdded {
            node_id: node.id,
            device_id: device.id,
            total_bytes: device.storage.total,
        });
        Ok(())
    }

    // =========================================================================
    // Device Info
    // =========================================================================

    pub fn device_info(&self, device_id: &str) -> Result<DeviceInfo> {
        self.store
            .view(|tx| DeviceEntry::from_id(tx, device_id).map(|d| d.info()))
    }

    // =========================================================================
    // Device Delete
    // =========================================================================

    /// Check a device can go, then tear it down in the background
    pub async fn delete_device(self: &Arc<Self>, device_id: &str) -> Result<JobId> {
        let result = self.plan_delete(device_id).await;
        let plan = self.rejected("device_delete", result)?;

        let this = Arc::clone(self);
        Ok(self
            .jobs
            .submit("device_delete", move || async move {
                this.run_device_delete(plan).await.map(|_| None)
            }))
    }

    async fn plan_delete(&self, device_id: &str) -> Result<DeletePlan> {
        let (plan, used_elsewhere) = self.store.view(|tx| {
            let device = DeviceEntry::from_id(tx, device_id)?;
            let node = NodeEntry::from_id(tx, &device.node_id)?;
            if !node.devices.contains(&device.id) {
                return Err(Error::Conflict(format!(
                    "Unable to delete device [{}] because it is still being added",
                    device.id
                )));
            }
            let cluster = ClusterEntry::from_id(tx, &node.cluster_id)?;
            let used_elsewhere = cluster_used_bytes(tx, &cluster, &device.id)?;
            Ok((
                DeletePlan {
                    device,
                    node,
                    cluster,
                },
                used_elsewhere,
            ))
        })?;

        let members = self
            .allocator
            .zone_members(&plan.cluster.id, plan.node.zone)
            .await?;
        let last_in_zone =
            used_elsewhere > 0 && members.len() == 1 && members[0] == plan.device.id;

        if !plan.device.is_delete_ok(last_in_zone) {
            return Err(Error::Conflict(plan.device.conflict_string(last_in_zone)));
        }
        Ok(plan)
    }

    async fn run_device_delete(&self, plan: DeletePlan) -> Result<()> {
        let mut saga = self.saga("device_delete");
        let result = self.decommission_device(&mut saga, &plan).await;
        self.settle("device_delete", saga, result).await
    }

    async fn decommission_device(&self, saga: &mut Saga, plan: &DeletePlan) -> Result<()> {
        let DeletePlan {
            device,
            node,
            cluster,
        } = plan;

        // A teardown failure leaves the device registered so it can be retried
        self.executor
            .device_teardown(node.manage_hostname()?, &device.name, &device.id)
            .await?;

        let device_lock = self.lock_device(&device.id).await;
        self.allocator.remove_device(cluster, node, device).await?;
        {
            let allocator = Arc::clone(&self.allocator);
            let plan = plan.clone();
            saga.on_rollback("re-add device to allocator", move || {
                let allocator = Arc::clone(&allocator);
                let plan = plan.clone();
                async move {
                    allocator
                        .add_device(&plan.cluster, &plan.node, &plan.device)
                        .await
                }
            });
        }

        self.store.update(|tx| {
            match NodeEntry::from_id(tx, &device.node_id) {
                Ok(mut node) => {
                    node.device_delete(&device.id);
                    node.save(tx)?;
                }
                Err(e) if e.is_not_found() => self.consistency_fault(format!(
                    "Node {} of device {} does not exist",
                    device.node_id, device.id
                )),
                Err(e) => return Err(e),
            }
            device.deregister(tx)
        })?;
        drop(device_lock);
        self.device_locks.remove(&device.id);

        info!("Deleted device {} ({}) from node {}", device.id, device.name, node.id);
        publish(&self.events, TopologyEvent::DeviceRemoved {
            node_id: node.id.clone(),
            device_id: device.id.clone(),
        });
        Ok(())
    }

    // =========================================================================
    // Device State
    // =========================================================================

    /// Change the operational state of a device
    ///
    /// Calls for the same device are serialized so allocator updates land in
    /// commit order.
    pub async fn set_device_state(&self, device_id: &str, state: DeviceState) -> Result<()> {
        let _device_lock = self.lock_device(device_id).await;
        let result = self.store.update(|tx| {
            let mut device = DeviceEntry::from_id(tx, device_id)?;
            let previous = device.state;
            let change = device.set_state(state)?;
            if device.state != previous {
                device.save(tx)?;
            }
            let node = NodeEntry::from_id(tx, &device.node_id)?;
            let cluster = ClusterEntry::from_id(tx, &node.cluster_id)?;
            Ok((previous, change, cluster, node, device))
        });
        let (previous, change, cluster, node, device) =
            self.rejected("device_state", result)?;

        if previous == state {
            debug!(device_id, %state, "Device already in requested state");
            return Ok(());
        }

        let mut saga = self.saga("device_state");
        {
            let store = Arc::clone(&self.store);
            let id = device.id.clone();
            saga.on_rollback("restore device state", move || {
                let store = Arc::clone(&store);
                let id = id.clone();
                async move {
                    store.update(|tx| {
                        let mut device = DeviceEntry::from_id(tx, &id)?;
                        if device.state != state {
                            warn!(device_id = %id, "Device state changed again, not restoring");
                            return Ok(());
                        }
                        device.restore_state(previous);
                        device.save(tx)
                    })
                }
            });
        }

        let result = match change {
            PoolChange::Include => self.allocator.include_device(&cluster, &node, &device).await,
            PoolChange::Exclude => self.allocator.exclude_device(&cluster, &node, &device).await,
            PoolChange::Unchanged => Ok(()),
        };
        self.settle("device_state", saga, result).await?;

        info!("Device {} state: {} -> {}", device.id, previous, state);
        publish(&self.events, TopologyEvent::DeviceStateChanged {
            device_id: device.id,
            from: previous,
            to: state,
        });
        Ok(())
    }

    // =========================================================================
    // Resync
    // =========================================================================

    /// Reconcile one device's capacity in the background
    pub fn resync_device(self: &Arc<Self>, device_id: &str) -> Result<JobId> {
        let result = self.reconciler.snapshot_device(device_id);
        let revision = self.rejected("device_resync", result)?;

        let this = Arc::clone(self);
        Ok(self
            .jobs
            .submit("device_resync", move || async move {
                this.run_resync("device_resync", vec![revision])
                    .await
                    .map(|_| None)
            }))
    }

    /// Reconcile every device of a node in the background
    ///
    /// Returns `None` when the node has no devices to check.
    pub fn resync_node(self: &Arc<Self>, node_id: &str) -> Result<Option<JobId>> {
        let result = self.reconciler.snapshot_node(node_id);
        let revisions = self.rejected("node_resync", result)?;

        if revisions.is_empty() {
            info!("Node {} has no devices to resync", node_id);
            self.metrics.record_operation("node_resync", Outcome::Succeeded);
            return Ok(None);
        }

        let this = Arc::clone(self);
        Ok(Some(self.jobs.submit("node_resync", move || async move {
            this.run_resync("node_resync", revisions).await.map(|_| None)
        })))
    }

    async fn run_resync(
        &self,
        operation: &str,
        revisions: Vec<super::resync::DeviceRevision>,
    ) -> Result<ResyncReport> {
        let result = self.reconciler.reconcile(revisions).await;
        let outcome = if result.is_ok() {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };
        self.metrics.record_operation(operation, outcome);
        result
    }
}

/// Remove a device id from its node, tolerating a missing node
fn unlink_device(tx: &mut WriteTx, node_id: &str, device_id: &str) -> Result<()> {
    match NodeEntry::from_id(tx, node_id) {
        Ok(mut node) => {
            if node.device_delete(device_id) {
                node.save(tx)?;
            }
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bytes in use on every device of a cluster except `exclude`
fn cluster_used_bytes<T: Transaction + ?Sized>(
    tx: &T,
    cluster: &ClusterEntry,
    exclude: &str,
) -> Result<u64> {
    let mut used = 0u64;
    for node_id in &cluster.nodes {
        let node = match NodeEntry::from_id(tx, node_id) {
            Ok(node) => node,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        for device_id in node.devices.iter().filter(|id| id.as_str() != exclude) {
            match DeviceEntry::from_id(tx, device_id) {
                Ok(device) => used = used.saturating_add(device.storage.used),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(used)
}

// =============================================================================
// Test Support
// =============================================================================


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::controlplane::JobStatus;
    use crate::executor::MockOperation;
    use crate::topology::{Hostnames, DEFAULT_ZONE};
    use assert_matches::assert_matches;

    const MIB: u64 = 1024 * 1024;

    fn add_request(node_id: &str, name: &str) -> DeviceAddRequest {
        DeviceAddRequest {
            node_id: node_id.to_string(),
            name: name.to_string(),
        }
    }

    // =========================================================================
    // Clusters and nodes
    // =========================================================================

    #[tokio::test]
    async fn test_cluster_and_node_membership() {
        let h = Harness::new();
        let cluster = h.cluster();
        let node = h.node(&cluster, "manage.a", 2);

        let info = h.orchestrator.cluster_info(&cluster).unwrap();
        assert_eq!(info.nodes, vec![node.clone()]);
        assert_eq!(h.orchestrator.list_clusters().unwrap(), vec![cluster.clone()]);

        let err = h.orchestrator.delete_cluster(&cluster).unwrap_err();
        assert_matches!(err, Error::Conflict(_));

        h.orchestrator.delete_node(&node).unwrap();
        assert!(h.orchestrator.cluster_info(&cluster).unwrap().nodes.is_empty());
        h.orchestrator.delete_cluster(&cluster).unwrap();
        assert!(h.orchestrator.cluster_info(&cluster).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_node_hostnames_are_unique() {
        let h = Harness::new();
        let cluster = h.cluster();
        h.node(&cluster, "manage.a", DEFAULT_ZONE);

        let err = h
            .orchestrator
            .add_node(NodeAddRequest {
                cluster_id: cluster.clone(),
                hostnames: Hostnames {
                    manage: vec!["manage.a".into()],
                    storage: vec!["storage.other".into()],
                },
                zone: DEFAULT_ZONE,
            })
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));

        let err = h
            .orchestrator
            .add_node(NodeAddRequest {
                cluster_id: "missing".into(),
                hostnames: Hostnames {
                    manage: vec!["manage.b".into()],
                    storage: vec!["storage.b".into()],
                },
                zone: DEFAULT_ZONE,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_node_with_devices_cannot_be_deleted() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.device(&node, "/dev/sdb").await;

        let err = h.orchestrator.delete_node(&node).unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    // =========================================================================
    // Device add
    // =========================================================================

    #[tokio::test]
    async fn test_add_device_provisions_and_links() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let mut events = h.orchestrator.subscribe();

        let device_id = h.device(&node, "/dev/sdb").await;

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.state, DeviceState::Online);
        assert_eq!(info.storage.total, 500 * MIB);
        assert_eq!(info.storage.free, 500 * MIB);
        assert_eq!(info.storage.used, 0);
        assert_eq!(info.extent_size, 4 * MIB);

        assert!(h.node_info(&node).devices.iter().any(|d| d.id == device_id));
        assert!(h.executor.is_provisioned(&device_id));
        assert!(h.allocator.pool.get(&device_id).await.unwrap().eligible);
        assert_matches!(
            events.recv().await.unwrap(),
            TopologyEvent::DeviceAdded { device_id: ref id, .. } if *id == device_id
        );
        assert_eq!(
            h.orchestrator
                .metrics()
                .operation_count("device_add", Outcome::Succeeded),
            1
        );
    }

    #[tokio::test]
    async fn test_add_device_rejections() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");

        let err = h.orchestrator.add_device(add_request(&node, "")).unwrap_err();
        assert_matches!(err, Error::Validation(_));

        let err = h
            .orchestrator
            .add_device(add_request("missing", "/dev/sdb"))
            .unwrap_err();
        assert!(err.is_not_found());

        h.device(&node, "/dev/sdb").await;
        let err = h
            .orchestrator
            .add_device(add_request(&node, "/dev/sdb"))
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));
        assert_eq!(h.orchestrator.jobs().pending(), 0);
    }

    #[tokio::test]
    async fn test_add_device_setup_failure_deregisters() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.executor.fail(MockOperation::Setup, "no such device");

        let job = h
            .orchestrator
            .add_device(add_request(&node, "/dev/sdb"))
            .unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { ref error } if error.contains("no such device"));

        assert!(h.node_info(&node).devices.is_empty());
        assert_eq!(h.orchestrator.status().unwrap().devices, 0);

        // The name is free again
        h.executor.clear_failure(MockOperation::Setup);
        h.device(&node, "/dev/sdb").await;
    }

    #[tokio::test]
    async fn test_add_device_allocator_failure_rolls_back_everything() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.allocator.fail(AllocatorOp::Add);

        let job = h
            .orchestrator
            .add_device(add_request(&node, "/dev/sdb"))
            .unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { .. });

        // Unlinked, torn down, deregistered
        assert!(h.node_info(&node).devices.is_empty());
        assert_eq!(h.orchestrator.status().unwrap().devices, 0);
        assert_eq!(h.executor.stats().provisioned, 0);
        assert_eq!(h.executor.stats().teardown_calls, 1);
        assert_eq!(
            h.orchestrator
                .metrics()
                .operation_count("device_add", Outcome::Failed),
            1
        );

        h.allocator.heal();
        h.device(&node, "/dev/sdb").await;
    }

    #[tokio::test]
    async fn test_add_device_second_transaction_failure_rolls_back() {
        let h = Harness::new();
        let cluster = h.cluster();
        let node = h.node(&cluster, "manage.a", DEFAULT_ZONE);
        h.executor.pause(MockOperation::Setup);

        let job = h.orchestrator.add_device(add_request(&node, "/dev/sdb")).unwrap();
        eventually(|| h.executor.stats().setup_calls == 1).await;
        let device_id = h.registered_device(&node, "/dev/sdb");

        // The linking transaction cannot load the cluster any more
        h.orchestrator
            .store()
            .update(|tx| {
                tx.delete::<ClusterEntry>(&cluster);
                Ok(())
            })
            .unwrap();
        h.executor.resume(MockOperation::Setup);

        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { ref error } if error.contains("cluster"));
        assert_eq!(h.executor.stats().teardown_calls, 1);
        assert!(!h.executor.is_provisioned(&device_id));
        assert!(!h.device_exists(&device_id));
        assert!(h.node_info(&node).devices.is_empty());

        let key = format!("device:{}:/dev/sdb", node);
        let claimed = h
            .orchestrator
            .store()
            .view(|tx| Ok(tx.contains(Bucket::Registry, &key)))
            .unwrap();
        assert!(!claimed);
    }

    #[tokio::test]
    async fn test_delete_refused_while_add_in_progress() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.executor.pause(MockOperation::Setup);

        let job = h.orchestrator.add_device(add_request(&node, "/dev/sdb")).unwrap();
        eventually(|| h.executor.stats().setup_calls == 1).await;
        let device_id = h.registered_device(&node, "/dev/sdb");

        let err = h.orchestrator.delete_device(&device_id).await.unwrap_err();
        assert_matches!(err, Error::Conflict(ref msg) if msg.contains("still being added"));

        h.executor.resume(MockOperation::Setup);
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { location: None });
        assert!(h.device_exists(&device_id));
        assert_eq!(h.node_info(&node).devices.len(), 1);
    }

    #[tokio::test]
    async fn test_add_device_does_not_resurrect_removed_row() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.executor.pause(MockOperation::Setup);

        let first_job = h.orchestrator.add_device(add_request(&node, "/dev/sdb")).unwrap();
        eventually(|| h.executor.stats().setup_calls == 1).await;
        let first = h.registered_device(&node, "/dev/sdb");

        // Row and name claim disappear while setup is running, and the name
        // is claimed again by a second add
        h.orchestrator
            .store()
            .update(|tx| DeviceEntry::from_id(tx, &first)?.deregister(tx))
            .unwrap();
        let second_job = h.orchestrator.add_device(add_request(&node, "/dev/sdb")).unwrap();
        eventually(|| h.executor.stats().setup_calls == 2).await;
        let second = h.registered_device(&node, "/dev/sdb");
        assert_ne!(first, second);

        h.executor.resume(MockOperation::Setup);
        let record = h.orchestrator.jobs().wait(&first_job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { .. });
        let record = h.orchestrator.jobs().wait(&second_job, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { location: None });

        assert!(!h.device_exists(&first));
        assert!(!h.executor.is_provisioned(&first));
        assert!(h.executor.is_provisioned(&second));
        let linked: Vec<String> = h.node_info(&node).devices.into_iter().map(|d| d.id).collect();
        assert_eq!(linked, vec![second.clone()]);

        // The surviving device still owns its name
        let err = h
            .orchestrator
            .add_device(add_request(&node, "/dev/sdb"))
            .unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[tokio::test]
    async fn test_add_device_keeps_state_changed_during_setup() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.executor.pause(MockOperation::Setup);

        let job = h.orchestrator.add_device(add_request(&node, "/dev/sdb")).unwrap();
        eventually(|| h.executor.stats().setup_calls == 1).await;
        let device_id = h.registered_device(&node, "/dev/sdb");
        h.orchestrator
            .set_device_state(&device_id, DeviceState::Offline)
            .await
            .unwrap();

        h.executor.resume(MockOperation::Setup);
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { location: None });

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.state, DeviceState::Offline);
        assert_eq!(info.storage.total, 500 * MIB);
        assert!(!h.allocator.pool.get(&device_id).await.unwrap().eligible);
    }

    #[tokio::test]
    async fn test_add_device_panic_still_compensates() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.allocator.panic_on(AllocatorOp::Add);

        let job = h
            .orchestrator
            .add_device(add_request(&node, "/dev/sdb"))
            .unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { .. });

        // Compensations are scheduled by the dropped saga
        for _ in 0..200 {
            if h.orchestrator.status().unwrap().devices == 0 && h.executor.stats().provisioned == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.orchestrator.status().unwrap().devices, 0);
        assert!(h.node_info(&node).devices.is_empty());
        assert_eq!(h.executor.stats().provisioned, 0);
    }

    // =========================================================================
    // Device delete
    // =========================================================================

    #[tokio::test]
    async fn test_delete_device_refuses_when_in_use() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.set_used(&device_id, 1);

        let err = h.orchestrator.delete_device(&device_id).await.unwrap_err();
        assert_matches!(err, Error::Conflict(ref msg) if msg.contains("allocated data"));

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.storage.used, 1);
        assert!(info.storage.free + info.storage.used == info.storage.total);
        assert_eq!(h.executor.stats().teardown_calls, 0);
    }

    #[tokio::test]
    async fn test_delete_device_removes_everything() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;

        let job = h.orchestrator.delete_device(&device_id).await.unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { location: None });

        assert!(!h.device_exists(&device_id));
        assert!(h.node_info(&node).devices.is_empty());
        assert!(!h.executor.is_provisioned(&device_id));
        assert!(h.allocator.pool.get(&device_id).await.is_none());

        // Name can be reused
        h.device(&node, "/dev/sdb").await;
    }

    #[tokio::test]
    async fn test_delete_device_teardown_failure_keeps_device() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.executor.fail(MockOperation::Teardown, "device busy");

        let job = h.orchestrator.delete_device(&device_id).await.unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { .. });

        assert!(h.device_exists(&device_id));
        assert!(h.node_info(&node).devices.iter().any(|d| d.id == device_id));
        assert!(h.allocator.pool.get(&device_id).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_device_allocator_failure_keeps_registration() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.allocator.fail(AllocatorOp::Remove);

        let job = h.orchestrator.delete_device(&device_id).await.unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { .. });
        assert!(h.device_exists(&device_id));
        assert!(h.allocator.pool.get(&device_id).await.is_some());
    }

    #[tokio::test]
    async fn test_delete_device_with_missing_node_is_a_consistency_fault() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;

        let plan = h.orchestrator.plan_delete(&device_id).await.unwrap();
        h.orchestrator
            .store()
            .update(|tx| {
                tx.delete::<NodeEntry>(&node);
                Ok(())
            })
            .unwrap();

        h.orchestrator.run_device_delete(plan).await.unwrap();
        assert!(!h.device_exists(&device_id));
        assert_eq!(h.orchestrator.metrics().consistency_faults(), 1);
    }

    #[tokio::test]
    async fn test_delete_last_device_of_zone_with_data_elsewhere() {
        let h = Harness::new();
        let cluster = h.cluster();
        let node_a = h.node(&cluster, "manage.a", 1);
        let node_b = h.node(&cluster, "manage.b", 2);
        let lonely = h.device(&node_a, "/dev/sdb").await;
        let busy = h.device(&node_b, "/dev/sdb").await;
        h.set_used(&busy, 4096);

        let err = h.orchestrator.delete_device(&lonely).await.unwrap_err();
        assert_matches!(err, Error::Conflict(ref msg) if msg.contains("failure domain"));

        // A second device in the zone lifts the restriction
        h.device(&node_a, "/dev/sdc").await;
        assert!(h.orchestrator.delete_device(&lonely).await.is_ok());
    }

    // =========================================================================
    // Device state
    // =========================================================================

    #[tokio::test]
    async fn test_set_state_drives_allocator() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;

        h.orchestrator
            .set_device_state(&device_id, DeviceState::Offline)
            .await
            .unwrap();
        assert!(!h.allocator.pool.get(&device_id).await.unwrap().eligible);

        h.orchestrator
            .set_device_state(&device_id, DeviceState::Failed)
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.device_info(&device_id).unwrap().state,
            DeviceState::Failed
        );

        let err = h
            .orchestrator
            .set_device_state(&device_id, DeviceState::Offline)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidStateTransition { .. });

        h.orchestrator
            .set_device_state(&device_id, DeviceState::Online)
            .await
            .unwrap();
        assert!(h.allocator.pool.get(&device_id).await.unwrap().eligible);

        // Same state is a no-op
        h.orchestrator
            .set_device_state(&device_id, DeviceState::Online)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_state_changes_apply_in_commit_order() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.allocator.hold(AllocatorOp::Exclude);

        let offline = {
            let orchestrator = h.orchestrator.clone();
            let id = device_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .set_device_state(&id, DeviceState::Offline)
                    .await
            })
        };
        eventually(|| h.allocator.calls(AllocatorOp::Exclude) == 1).await;

        let online = {
            let orchestrator = h.orchestrator.clone();
            let id = device_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .set_device_state(&id, DeviceState::Online)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!online.is_finished());

        h.allocator.release(AllocatorOp::Exclude);
        offline.await.unwrap().unwrap();
        online.await.unwrap().unwrap();

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.state, DeviceState::Online);
        assert!(h.allocator.pool.get(&device_id).await.unwrap().eligible);
        assert_eq!(h.allocator.calls(AllocatorOp::Include), 1);
    }

    #[tokio::test]
    async fn test_set_state_allocator_failure_restores_state() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.allocator.fail(AllocatorOp::Exclude);

        let err = h
            .orchestrator
            .set_device_state(&device_id, DeviceState::Offline)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            h.orchestrator.device_info(&device_id).unwrap().state,
            DeviceState::Online
        );
        assert!(h.allocator.pool.get(&device_id).await.unwrap().eligible);
    }

    // =========================================================================
    // Resync
    // =========================================================================

    #[tokio::test]
    async fn test_resync_node_end_to_end() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        h.executor.set_device_size("manage.a", "/dev/sdb", 200 * MIB);
        let device_id = h.device(&node, "/dev/sdb").await;
        h.set_used(&device_id, 1024);

        h.executor.set_device_size("manage.a", "/dev/sdb", 500 * MIB);
        let job = h.orchestrator.resync_node(&node).unwrap().unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed { location: None });

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.storage.total, 500 * MIB);
        assert_eq!(info.storage.free, 500 * MIB - 1024);
        assert_eq!(info.storage.used, 1024);
        assert_eq!(h.orchestrator.metrics().devices_resynced(), 1);
    }

    #[tokio::test]
    async fn test_resync_device_negative_free_fails_job() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        let device_id = h.device(&node, "/dev/sdb").await;
        h.set_used(&device_id, 300 * MIB);

        h.executor.set_device_size("manage.a", "/dev/sdb", 100 * MIB);
        let job = h.orchestrator.resync_device(&device_id).unwrap();
        let record = h.orchestrator.jobs().wait(&job, WAIT).await.unwrap();
        assert_matches!(record.status, JobStatus::Failed { ref error } if error.contains("Negative free space"));

        let info = h.orchestrator.device_info(&device_id).unwrap();
        assert_eq!(info.storage.total, 500 * MIB);
    }

    #[tokio::test]
    async fn test_resync_node_without_devices_is_immediate() {
        let h = Harness::new();
        let node = h.node_in_new_cluster("manage.a");
        assert_eq!(h.orchestrator.resync_node(&node).unwrap(), None);

        let err = h.orchestrator.resync_node("missing").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.orchestrator.jobs().pending(), 0);
    }
}
