//! Cluster Entry

use super::store::{Bucket, StoreEntry, Transaction, WriteTx};
use crate::error::{EntityKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Externally visible description of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub id: String,
    pub nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted cluster row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    #[serde(default)]
    pub nodes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl StoreEntry for ClusterEntry {
    const BUCKET: Bucket = Bucket::Cluster;
    const KIND: EntityKind = EntityKind::Cluster;

    fn key(&self) -> &str {
        &self.id
    }
}

impl Default for ClusterEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterEntry {
    pub fn new() -> Self {
        Self {
            id: super::generate_id(),
            nodes: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn from_id<T: Transaction + ?Sized>(tx: &T, id: &str) -> Result<Self> {
        tx.get(id)
    }

    pub fn node_add(&mut self, node_id: &str) -> bool {
        self.nodes.insert(node_id.to_string())
    }

    pub fn node_delete(&mut self, node_id: &str) -> bool {
        self.nodes.remove(node_id)
    }

    pub fn save(&self, tx: &mut WriteTx) -> Result<()> {
        tx.put(self)
    }

    pub fn delete(&self, tx: &mut WriteTx) -> Result<()> {
        tx.delete::<Self>(&self.id);
        Ok(())
    }

    pub fn info(&self) -> ClusterInfo {
        ClusterInfo {
            id: self.id.clone(),
            nodes: self.nodes.iter().cloned().collect(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyStore;

    #[test]
    fn test_cluster_roundtrip_through_store() {
        let store = TopologyStore::new();
        let mut cluster = ClusterEntry::new();
        cluster.node_add("n2");
        cluster.node_add("n1");
        store.update(|tx| cluster.save(tx)).unwrap();

        let loaded = store.view(|tx| ClusterEntry::from_id(tx, &cluster.id)).unwrap();
        assert_eq!(loaded.info().nodes, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(cluster.id.len(), 32);
    }
}
