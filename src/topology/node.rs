//! Node Entry

use super::device::{DeviceEntry, DeviceInfo};
use super::store::{Bucket, StoreEntry, Transaction, WriteTx};
use crate::error::{EntityKind, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default failure domain for nodes that do not name one
pub const DEFAULT_ZONE: u32 = 1;

fn default_zone() -> u32 {
    DEFAULT_ZONE
}

/// Network endpoints of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hostnames {
    /// Management endpoints; the first one is used by the executor
    #[serde(default)]
    pub manage: Vec<String>,
    /// Data-path endpoints
    #[serde(default)]
    pub storage: Vec<String>,
}

/// Externally visible description of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub cluster_id: String,
    pub hostnames: Hostnames,
    pub zone: u32,
    pub devices: Vec<DeviceInfo>,
}

/// Persisted node row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub cluster_id: String,
    pub hostnames: Hostnames,
    #[serde(default = "default_zone")]
    pub zone: u32,
    #[serde(default)]
    pub devices: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl StoreEntry for NodeEntry {
    const BUCKET: Bucket = Bucket::Node;
    const KIND: EntityKind = EntityKind::Node;

    fn key(&self) -> &str {
        &self.id
    }
}

impl NodeEntry {
    pub fn new(cluster_id: impl Into<String>, hostnames: Hostnames, zone: u32) -> Self {
        Self {
            id: super::generate_id(),
            cluster_id: cluster_id.into(),
            hostnames,
            zone,
            devices: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    pub fn from_id<T: Transaction + ?Sized>(tx: &T, id: &str) -> Result<Self> {
        tx.get(id)
    }

    fn registration_keys(&self) -> Vec<String> {
        self.hostnames
            .manage
            .iter()
            .map(|host| format!("node:manage:{}", host))
            .chain(
                self.hostnames
                    .storage
                    .iter()
                    .map(|host| format!("node:storage:{}", host)),
            )
            .collect()
    }

    /// Claim every hostname and insert the row
    pub fn register(&self, tx: &mut WriteTx) -> Result<()> {
        for key in self.registration_keys() {
            tx.register(Bucket::Registry, &key, self.id.as_bytes().to_vec())
                .map_err(|_| Error::Conflict(format!("Hostname already in use: {}", key)))?;
        }
        tx.insert(self)
    }

    /// Release hostnames and drop the row
    pub fn deregister(&self, tx: &mut WriteTx) -> Result<()> {
        for key in self.registration_keys() {
            tx.deregister(Bucket::Registry, &key);
        }
        tx.delete::<Self>(&self.id);
        Ok(())
    }

    /// Executor target for this node
    pub fn manage_hostname(&self) -> Result<&str> {
        self.hostnames
            .manage
            .first()
            .map(String::as_str)
            .ok_or_else(|| {
                Error::ConsistencyFault(format!("node {} has no manage hostname", self.id))
            })
    }

    /// Link a device; returns false if already linked
    pub fn device_add(&mut self, device_id: &str) -> bool {
        self.devices.insert(device_id.to_string())
    }

    /// Unlink a device; returns false if it was not linked
    pub fn device_delete(&mut self, device_id: &str) -> bool {
        self.devices.remove(device_id)
    }

    pub fn save(&self, tx: &mut WriteTx) -> Result<()> {
        tx.put(self)
    }

    pub fn delete(&self, tx: &mut WriteTx) -> Result<()> {
        tx.delete::<Self>(&self.id);
        Ok(())
    }

    /// Describe the node and every device that still resolves
    pub fn info<T: Transaction + ?Sized>(&self, tx: &T) -> Result<NodeInfo> {
        let mut devices = Vec::with_capacity(self.devices.len());
        for id in &self.devices {
            match DeviceEntry::from_id(tx, id) {
                Ok(device) => devices.push(device.info()),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(NodeInfo {
            id: self.id.clone(),
            cluster_id: self.cluster_id.clone(),
            hostnames: self.hostnames.clone(),
            zone: self.zone,
            devices,
        })
    }
}
