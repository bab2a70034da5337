//! Topology Resync
//!
//! Brings persisted device capacity in line with what the storage hosts
//! report. Works in three phases: snapshot the devices in a read
//! transaction, query every host with no transaction held, then apply all
//! changes in one write transaction. A device whose persisted usage exceeds
//! its new physical size fails the whole batch; free space is never clamped.

use super::metrics::OperationMetrics;
use crate::domain::ports::DeviceExecutorRef;
use crate::error::Result;
use crate::topology::{publish, DeviceEntry, NodeEntry, TopologyEvent, TopologyStore};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// What the reconciler needs to know about one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRevision {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub manage_host: String,
    /// Persisted total at snapshot time
    pub total: u64,
}

impl DeviceRevision {
    fn new(device: &DeviceEntry, manage_host: &str) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            node_id: device.node_id.clone(),
            manage_host: manage_host.to_string(),
            total: device.storage.total,
        }
    }
}

/// Summary of one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Devices checked against their host
    pub checked: usize,
    /// Devices whose reported size differed
    pub changed: usize,
    /// Devices written
    pub updated: usize,
    /// Changed devices that disappeared before the write
    pub vanished: usize,
}

/// Reconciles persisted capacity against the executor
pub struct TopologyReconciler {
    store: Arc<TopologyStore>,
    executor: DeviceExecutorRef,
    metrics: Arc<OperationMetrics>,
    events: broadcast::Sender<TopologyEvent>,
}

impl TopologyReconciler {
    pub fn new(
        store: Arc<TopologyStore>,
        executor: DeviceExecutorRef,
        metrics: Arc<OperationMetrics>,
        events: broadcast::Sender<TopologyEvent>,
    ) -> Self {
        Self {
            store,
            executor,
            metrics,
            events,
        }
    }

    /// Snapshot every device of a node
    ///
    /// Device ids that no longer resolve are skipped.
    pub fn snapshot_node(&self, node_id: &str) -> Result<Vec<DeviceRevision>> {
        self.store.view(|tx| {
            let node = NodeEntry::from_id(tx, node_id)?;
            let host = node.manage_hostname()?;

            let mut revisions = Vec::with_capacity(node.devices.len());
            for id in &node.devices {
                match DeviceEntry::from_id(tx, id) {
                    Ok(device) => revisions.push(DeviceRevision::new(&device, host)),
                    Err(e) if e.is_not_found() => {
                        debug!(device_id = %id, node_id, "Skipping unresolvable device");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(revisions)
        })
    }

    /// Snapshot a single device
    pub fn snapshot_device(&self, device_id: &str) -> Result<DeviceRevision> {
        self.store.view(|tx| {
            let device = DeviceEntry::from_id(tx, device_id)?;
            let node = NodeEntry::from_id(tx, &device.node_id)?;
            Ok(DeviceRevision::new(&device, node.manage_hostname()?))
        })
    }

    /// Query and apply new sizes for a batch of devices
    pub async fn reconcile(&self, revisions: Vec<DeviceRevision>) -> Result<ResyncReport> {
        let unique: BTreeMap<String, DeviceRevision> = revisions
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let mut report = ResyncReport {
            checked: unique.len(),
            ..Default::default()
        };

        let queries = unique.values().map(|rev| async move {
            let physical = self
                .executor
                .get_device_info(&rev.manage_host, &rev.name, &rev.id)
                .await?;
            Ok::<_, crate::error::Error>((rev, physical.size))
        });
        let observed = try_join_all(queries).await?;

        let changed: Vec<(&DeviceRevision, u64)> = observed
            .into_iter()
            .filter(|(rev, size)| *size != rev.total)
            .collect();
        report.changed = changed.len();

        if changed.is_empty() {
            info!("All devices are up to date");
            return Ok(report);
        }

        let (updated, vanished, events) = self.store.update(|tx| {
            let mut updated = 0;
            let mut vanished = 0;
            let mut events = Vec::with_capacity(changed.len());

            for (rev, new_total) in &changed {
                let mut device = match DeviceEntry::from_id(tx, &rev.id) {
                    Ok(device) => device,
                    Err(e) if e.is_not_found() => {
                        debug!(device_id = %rev.id, "Device vanished before resync write");
                        vanished += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let old = device.storage;
                device.resize(*new_total)?;
                info!(
                    "Updating device {} ({}). Total: {} -> {}. Free: {} -> {}",
                    device.id,
                    device.name,
                    old.total,
                    device.storage.total,
                    old.free,
                    device.storage.free
                );
                device.save(tx)?;
                updated += 1;

                events.push(TopologyEvent::DeviceResized {
                    node_id: device.node_id.clone(),
                    device_id: device.id.clone(),
                    old_total: old.total,
                    new_total: device.storage.total,
                });
            }

            Ok((updated, vanished, events))
        })?;

        report.updated = updated;
        report.vanished = vanished;
        self.metrics.record_devices_resynced(updated);
        for event in events {
            publish(&self.events, event);
        }

        info!("Updated {} device(s)", updated);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::executor::{MockExecutor, MockOperation};
    use crate::topology::{ClusterEntry, Hostnames, DEFAULT_ZONE};
    use assert_matches::assert_matches;

    const MIB: u64 = 1024 * 1024;
    const HOST: &str = "manage.node1";

    struct Fixture {
        store: Arc<TopologyStore>,
        executor: Arc<MockExecutor>,
        reconciler: TopologyReconciler,
        node_id: String,
    }

    fn fixture(devices: &[(&str, u64, u64)]) -> (Fixture, Vec<String>) {
        let store = TopologyStore::new();
        let executor = Arc::new(MockExecutor::default());
        let metrics = OperationMetrics::new().unwrap();
        let (events, _) = broadcast::channel(16);

        let mut cluster = ClusterEntry::new();
        let mut node = NodeEntry::new(
            cluster.id.clone(),
            Hostnames {
                manage: vec![HOST.into()],
                storage: vec!["storage.node1".into()],
            },
            DEFAULT_ZONE,
        );
        cluster.node_add(&node.id);

        let mut ids = Vec::new();
        store
            .update(|tx| {
                for (name, total, used) in devices {
                    let mut device = DeviceEntry::new(*name, node.id.clone());
                    device.storage_set(*total);
                    device.storage_allocate(*used)?;
                    device.register(tx)?;
                    node.device_add(&device.id);
                    ids.push(device.id.clone());
                    executor.set_device_size(HOST, name, *total);
                }
                node.register(tx)?;
                cluster.save(tx)
            })
            .unwrap();

        let reconciler = TopologyReconciler::new(
            Arc::clone(&store),
            executor.clone(),
            metrics,
            events,
        );
        (
            Fixture {
                store,
                executor,
                reconciler,
                node_id: node.id,
            },
            ids,
        )
    }

    #[tokio::test]
    async fn test_resync_applies_new_size_and_keeps_used() {
        let (f, ids) = fixture(&[("/dev/sdb", 200 * MIB, 1024)]);
        f.executor.set_device_size(HOST, "/dev/sdb", 500 * MIB);

        let revision = f.reconciler.snapshot_device(&ids[0]).unwrap();
        let report = f.reconciler.reconcile(vec![revision]).await.unwrap();
        assert_eq!(report.updated, 1);

        let device = f.store.view(|tx| DeviceEntry::from_id(tx, &ids[0])).unwrap();
        assert_eq!(device.storage.total, 500 * MIB);
        assert_eq!(device.storage.free, 500 * MIB - 1024);
        assert_eq!(device.storage.used, 1024);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let (f, _) = fixture(&[("/dev/sdb", 200 * MIB, 0)]);
        f.executor.set_device_size(HOST, "/dev/sdb", 300 * MIB);

        let first = f
            .reconciler
            .reconcile(f.reconciler.snapshot_node(&f.node_id).unwrap())
            .await
            .unwrap();
        assert_eq!(first.updated, 1);

        let writes = f.store.stats().entity_writes;
        let second = f
            .reconciler
            .reconcile(f.reconciler.snapshot_node(&f.node_id).unwrap())
            .await
            .unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(f.store.stats().entity_writes, writes);
    }

    #[tokio::test]
    async fn test_batch_writes_only_changed_devices() {
        let (f, ids) = fixture(&[
            ("/dev/sdb", 100 * MIB, 0),
            ("/dev/sdc", 100 * MIB, 0),
            ("/dev/sdd", 100 * MIB, 0),
        ]);
        f.executor.set_device_size(HOST, "/dev/sdc", 150 * MIB);

        let commits = f.store.stats().commits;
        let writes = f.store.stats().entity_writes;
        let mut revisions = f.reconciler.snapshot_node(&f.node_id).unwrap();
        // Duplicates collapse
        revisions.push(revisions[0].clone());

        let report = f.reconciler.reconcile(revisions).await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.changed, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(f.store.stats().commits, commits + 1);
        assert_eq!(f.store.stats().entity_writes, writes + 1);

        let totals: Vec<u64> = f
            .store
            .view(|tx| {
                ids.iter()
                    .map(|id| DeviceEntry::from_id(tx, id).map(|d| d.storage.total))
                    .collect()
            })
            .unwrap();
        assert_eq!(totals, vec![100 * MIB, 150 * MIB, 100 * MIB]);
    }

    #[tokio::test]
    async fn test_negative_free_space_aborts_batch() {
        let (f, ids) = fixture(&[("/dev/sdb", 200, 150), ("/dev/sdc", 200, 0)]);
        f.executor.set_device_size(HOST, "/dev/sdb", 100);
        f.executor.set_device_size(HOST, "/dev/sdc", 400);

        let revisions = f.reconciler.snapshot_node(&f.node_id).unwrap();
        let err = f.reconciler.reconcile(revisions).await.unwrap_err();
        assert_matches!(err, Error::NegativeFreeSpace { total: 100, used: 150, .. });

        // Nothing was written, not even the healthy device
        let devices: Vec<DeviceEntry> = f
            .store
            .view(|tx| ids.iter().map(|id| DeviceEntry::from_id(tx, id)).collect())
            .unwrap();
        assert_eq!(devices[0].storage.total, 200);
        assert_eq!(devices[0].storage.free, 50);
        assert_eq!(devices[1].storage.total, 200);
    }

    #[tokio::test]
    async fn test_size_query_failure_aborts_without_writes() {
        let (f, _) = fixture(&[("/dev/sdb", 200, 0)]);
        f.executor.set_device_size(HOST, "/dev/sdb", 300);
        f.executor.fail(MockOperation::Info, "host unreachable");

        let writes = f.store.stats().entity_writes;
        let revisions = f.reconciler.snapshot_node(&f.node_id).unwrap();
        let err = f.reconciler.reconcile(revisions).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.store.stats().entity_writes, writes);
    }

    #[tokio::test]
    async fn test_vanished_device_is_skipped() {
        let (f, ids) = fixture(&[("/dev/sdb", 200, 0)]);
        f.executor.set_device_size(HOST, "/dev/sdb", 300);

        let revisions = f.reconciler.snapshot_node(&f.node_id).unwrap();
        f.store
            .update(|tx| {
                let device = DeviceEntry::from_id(tx, &ids[0])?;
                device.deregister(tx)
            })
            .unwrap();

        let report = f.reconciler.reconcile(revisions).await.unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.vanished, 1);
        assert_eq!(report.updated, 0);
    }

    #[tokio::test]
    async fn test_snapshot_of_unknown_node() {
        let (f, _) = fixture(&[]);
        let err = f.reconciler.snapshot_node("missing").unwrap_err();
        assert!(err.is_not_found());
    }
}
