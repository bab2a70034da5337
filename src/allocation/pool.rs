//! Placement Pool
//!
//! Tracks which devices the allocator may place data on. Placement itself is
//! out of scope; the pool keeps per-device eligibility, zone membership and
//! free capacity so that callers can ask who is left in a failure domain.

use crate::domain::ports::DeviceAllocator;
use crate::error::Result;
use crate::topology::{ClusterEntry, DeviceEntry, DeviceState, NodeEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Placement Record
// =============================================================================

/// What the pool knows about one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRecord {
    pub device_id: String,
    pub cluster_id: String,
    pub node_id: String,
    pub zone: u32,
    pub free_bytes: u64,
    /// Whether new data may be placed here
    pub eligible: bool,
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub devices: usize,
    pub eligible: usize,
    pub adds: u64,
    pub removes: u64,
}

// =============================================================================
// Placement Pool
// =============================================================================

/// In-memory allocator implementation
pub struct PlacementPool {
    records: RwLock<HashMap<String, PlacementRecord>>,
    adds: AtomicU64,
    removes: AtomicU64,
}

impl Default for PlacementPool {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            adds: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }
}

impl PlacementPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up a device record
    pub async fn get(&self, device_id: &str) -> Option<PlacementRecord> {
        self.records.read().await.get(device_id).cloned()
    }

    /// Eligible device ids of a cluster, sorted
    pub async fn eligible_devices(&self, cluster_id: &str) -> Vec<String> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .values()
            .filter(|r| r.eligible && r.cluster_id == cluster_id)
            .map(|r| r.device_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> PoolStats {
        let records = self.records.read().await;
        PoolStats {
            devices: records.len(),
            eligible: records.values().filter(|r| r.eligible).count(),
            adds: self.adds.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }

    async fn set_eligible(&self, device_id: &str, eligible: bool) {
        if let Some(record) = self.records.write().await.get_mut(device_id) {
            record.eligible = eligible;
            debug!(device_id, eligible, "Placement eligibility changed");
        }
    }
}

#[async_trait]
impl DeviceAllocator for PlacementPool {
    async fn add_device(
        &self,
        cluster: &ClusterEntry,
        node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()> {
        let record = PlacementRecord {
            device_id: device.id.clone(),
            cluster_id: cluster.id.clone(),
            node_id: node.id.clone(),
            zone: node.zone,
            free_bytes: device.storage.free,
            eligible: device.state == DeviceState::Online,
        };

        self.records.write().await.insert(device.id.clone(), record);
        self.adds.fetch_add(1, Ordering::Relaxed);
        info!(
            "Added device {} (node {}, zone {}) to placement pool",
            device.id, node.id, node.zone
        );
        Ok(())
    }

    async fn remove_device(
        &self,
        _cluster: &ClusterEntry,
        _node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()> {
        if self.records.write().await.remove(&device.id).is_some() {
            self.removes.fetch_add(1, Ordering::Relaxed);
            info!("Removed device {} from placement pool", device.id);
        }
        Ok(())
    }

    async fn include_device(
        &self,
        _cluster: &ClusterEntry,
        _node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()> {
        self.set_eligible(&device.id, true).await;
        Ok(())
    }

    async fn exclude_device(
        &self,
        _cluster: &ClusterEntry,
        _node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()> {
        self.set_eligible(&device.id, false).await;
        Ok(())
    }

    async fn zone_members(&self, cluster_id: &str, zone: u32) -> Result<Vec<String>> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .values()
            .filter(|r| r.eligible && r.cluster_id == cluster_id && r.zone == zone)
            .map(|r| r.device_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
