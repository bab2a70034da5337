//! Transactional Topology Store
//!
//! A copy-on-write key-value store holding cluster, node and device rows.
//! Writers are serialized behind a single writer lock and work on a private
//! copy of the committed snapshot; the copy is published only when the
//! transaction closure returns `Ok`. Readers grab the current snapshot and
//! never wait for writers.

use crate::error::{EntityKind, Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

// =============================================================================
// Buckets
// =============================================================================

/// Top-level key spaces of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    Cluster,
    Node,
    Device,
    /// Uniqueness keys (device name on node, node hostnames)
    Registry,
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bucket::Cluster => write!(f, "cluster"),
            Bucket::Node => write!(f, "node"),
            Bucket::Device => write!(f, "device"),
            Bucket::Registry => write!(f, "registry"),
        }
    }
}

/// A row type persisted in the store
pub trait StoreEntry: Serialize + DeserializeOwned {
    /// Bucket holding rows of this type
    const BUCKET: Bucket;
    /// Entity kind reported on failed lookups
    const KIND: EntityKind;

    /// Primary key of the row
    fn key(&self) -> &str;
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Default)]
struct Snapshot {
    buckets: BTreeMap<Bucket, BTreeMap<String, Vec<u8>>>,
}

impl Snapshot {
    fn get(&self, bucket: Bucket, key: &str) -> Option<&[u8]> {
        self.buckets
            .get(&bucket)
            .and_then(|rows| rows.get(key))
            .map(Vec::as_slice)
    }

    fn keys(&self, bucket: Bucket) -> Vec<String> {
        self.buckets
            .get(&bucket)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }
}

// =============================================================================
// Transactions
// =============================================================================

/// Read access shared by view and update transactions
pub trait Transaction {
    /// Raw bytes stored under `key`
    fn raw(&self, bucket: Bucket, key: &str) -> Option<&[u8]>;

    /// All keys of a bucket, in key order
    fn keys(&self, bucket: Bucket) -> Vec<String>;

    /// Check whether a key exists
    fn contains(&self, bucket: Bucket, key: &str) -> bool {
        self.raw(bucket, key).is_some()
    }

    /// Load a row by primary key
    fn get<E: StoreEntry>(&self, id: &str) -> Result<E> {
        let bytes = self
            .raw(E::BUCKET, id)
            .ok_or_else(|| Error::not_found(E::KIND, id))?;
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Load every row of a type
    fn list<E: StoreEntry>(&self) -> Result<Vec<E>> {
        self.keys(E::BUCKET)
            .iter()
            .map(|key| self.get::<E>(key))
            .collect()
    }
}

/// Read-only transaction over a committed snapshot
pub struct ReadTx<'a> {
    snapshot: &'a Snapshot,
}

impl Transaction for ReadTx<'_> {
    fn raw(&self, bucket: Bucket, key: &str) -> Option<&[u8]> {
        self.snapshot.get(bucket, key)
    }

    fn keys(&self, bucket: Bucket) -> Vec<String> {
        self.snapshot.keys(bucket)
    }
}

/// Read-write transaction over a private copy of the snapshot
pub struct WriteTx {
    working: Snapshot,
    writes: u64,
}

impl Transaction for WriteTx {
    fn raw(&self, bucket: Bucket, key: &str) -> Option<&[u8]> {
        self.working.get(bucket, key)
    }

    fn keys(&self, bucket: Bucket) -> Vec<String> {
        self.working.keys(bucket)
    }
}

impl WriteTx {
    fn rows(&mut self, bucket: Bucket) -> &mut BTreeMap<String, Vec<u8>> {
        self.working.buckets.entry(bucket).or_default()
    }

    /// Insert or overwrite a row
    pub fn put<E: StoreEntry>(&mut self, entry: &E) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.rows(E::BUCKET).insert(entry.key().to_string(), bytes);
        self.writes += 1;
        Ok(())
    }

    /// Insert a row, failing with `Conflict` if the key is taken
    pub fn insert<E: StoreEntry>(&mut self, entry: &E) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        self.register(E::BUCKET, entry.key(), bytes)
    }

    /// Remove a row; removing a missing row is not an error
    pub fn delete<E: StoreEntry>(&mut self, id: &str) -> bool {
        let removed = self.rows(E::BUCKET).remove(id).is_some();
        if removed {
            self.writes += 1;
        }
        removed
    }

    /// Insert a raw key that must not exist yet
    pub fn register(&mut self, bucket: Bucket, key: &str, value: Vec<u8>) -> Result<()> {
        let rows = self.rows(bucket);
        if rows.contains_key(key) {
            return Err(Error::Conflict(format!(
                "key {} already exists in {}",
                key, bucket
            )));
        }
        rows.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }

    /// Remove a raw key
    pub fn deregister(&mut self, bucket: Bucket, key: &str) -> bool {
        let removed = self.rows(bucket).remove(key).is_some();
        if removed {
            self.writes += 1;
        }
        removed
    }
}

// =============================================================================
// Store Statistics
// =============================================================================

#[derive(Debug, Default)]
struct StoreStats {
    views: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    entity_writes: AtomicU64,
}

/// Point-in-time copy of the store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    pub views: u64,
    pub commits: u64,
    pub aborts: u64,
    /// Rows written by committed transactions
    pub entity_writes: u64,
}

// =============================================================================
// Topology Store
// =============================================================================

/// Transactional store for the cluster topology
pub struct TopologyStore {
    committed: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
    stats: StoreStats,
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyStore")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TopologyStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            committed: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
            stats: StoreStats::default(),
        })
    }

    /// Run `f` against a consistent snapshot
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTx<'_>) -> Result<T>,
    {
        let snapshot = Arc::clone(&self.committed.read());
        self.stats.views.fetch_add(1, Ordering::Relaxed);
        f(&ReadTx {
            snapshot: &snapshot,
        })
    }

    /// Run `f` as the only writer; changes are published only on `Ok`
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTx) -> Result<T>,
    {
        let _writer = self.writer.lock();
        let base = Arc::clone(&self.committed.read());
        let mut tx = WriteTx {
            working: (*base).clone(),
            writes: 0,
        };

        match f(&mut tx) {
            Ok(value) => {
                let writes = tx.writes;
                *self.committed.write() = Arc::new(tx.working);
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.stats.entity_writes.fetch_add(writes, Ordering::Relaxed);
                trace!(writes, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                self.stats.aborts.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Transaction aborted");
                Err(e)
            }
        }
    }

    /// Get store counters
    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            views: self.stats.views.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
            aborts: self.stats.aborts.load(Ordering::Relaxed),
            entity_writes: self.stats.entity_writes.load(Ordering::Relaxed),
        }
    }
}
