//! Device Entry
//!
//! One physical storage device attached to a node. Owns the capacity
//! bookkeeping (`total == free + used`) and the state machine that decides
//! whether the device takes part in placement.

use super::store::{Bucket, StoreEntry, Transaction, WriteTx};
use crate::error::{EntityKind, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Device State
// =============================================================================

/// Operational state of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Online,
    Offline,
    Failed,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Online => write!(f, "online"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for DeviceState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "online" => Ok(DeviceState::Online),
            "offline" => Ok(DeviceState::Offline),
            "failed" => Ok(DeviceState::Failed),
            other => Err(Error::Validation(format!("unknown device state: {}", other))),
        }
    }
}

/// Allocator effect of a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolChange {
    Unchanged,
    /// Device becomes eligible for placement again
    Include,
    /// Device must no longer receive placements
    Exclude,
}

// =============================================================================
// Storage Size
// =============================================================================

/// Capacity counters in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSize {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

impl StorageSize {
    /// Check the `total == free + used` invariant
    pub fn is_consistent(&self) -> bool {
        self.free.checked_add(self.used) == Some(self.total)
    }
}

// =============================================================================
// Device Info
// =============================================================================

/// Externally visible description of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub state: DeviceState,
    pub storage: StorageSize,
    pub extent_size: u64,
}

// =============================================================================
// Device Entry
// =============================================================================

/// Persisted device row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub state: DeviceState,
    pub storage: StorageSize,
    pub extent_size: u64,
    pub created_at: DateTime<Utc>,
}

impl StoreEntry for DeviceEntry {
    const BUCKET: Bucket = Bucket::Device;
    const KIND: EntityKind = EntityKind::Device;

    fn key(&self) -> &str {
        &self.id
    }
}

impl DeviceEntry {
    /// Create a new, unprovisioned device entry
    pub fn new(name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id: super::generate_id(),
            name: name.into(),
            node_id: node_id.into(),
            state: DeviceState::Online,
            storage: StorageSize::default(),
            extent_size: 0,
            created_at: Utc::now(),
        }
    }

    /// Load a device by id
    pub fn from_id<T: Transaction + ?Sized>(tx: &T, id: &str) -> Result<Self> {
        tx.get(id)
    }

    fn registration_key(&self) -> String {
        format!("device:{}:{}", self.node_id, self.name)
    }

    /// Insert the device row and claim its name on the node
    pub fn register(&self, tx: &mut WriteTx) -> Result<()> {
        tx.register(
            Bucket::Registry,
            &self.registration_key(),
            self.id.as_bytes().to_vec(),
        )
        .map_err(|_| {
            Error::Conflict(format!(
                "Device {} is already registered on node {}",
                self.name, self.node_id
            ))
        })?;
        tx.insert(self)
    }

    /// Check that the name claim on the node still belongs to this device
    pub fn is_registered<T: Transaction + ?Sized>(&self, tx: &T) -> bool {
        tx.raw(Bucket::Registry, &self.registration_key()) == Some(self.id.as_bytes())
    }

    /// Release the name claim and drop any remaining row
    ///
    /// A claim that has since passed to another device is left alone.
    pub fn deregister(&self, tx: &mut WriteTx) -> Result<()> {
        if self.is_registered(tx) {
            tx.deregister(Bucket::Registry, &self.registration_key());
        }
        tx.delete::<Self>(&self.id);
        Ok(())
    }

    /// Persist the current fields
    pub fn save(&self, tx: &mut WriteTx) -> Result<()> {
        tx.put(self)
    }

    /// Remove the row
    pub fn delete(&self, tx: &mut WriteTx) -> Result<()> {
        tx.delete::<Self>(&self.id);
        Ok(())
    }

    /// Initialize capacity from the size reported at setup
    pub fn storage_set(&mut self, total: u64) {
        self.storage = StorageSize {
            total,
            free: total,
            used: 0,
        };
    }

    /// Move `amount` bytes from free to used
    pub fn storage_allocate(&mut self, amount: u64) -> Result<()> {
        let free = self.storage.free.checked_sub(amount).ok_or_else(|| {
            Error::Conflict(format!(
                "Device {} has {} bytes free, cannot allocate {}",
                self.id, self.storage.free, amount
            ))
        })?;
        self.storage.free = free;
        self.storage.used += amount;
        Ok(())
    }

    /// Move `amount` bytes from used back to free
    pub fn storage_free(&mut self, amount: u64) -> Result<()> {
        let used = self.storage.used.checked_sub(amount).ok_or_else(|| {
            Error::Conflict(format!(
                "Device {} has {} bytes used, cannot free {}",
                self.id, self.storage.used, amount
            ))
        })?;
        self.storage.used = used;
        self.storage.free += amount;
        Ok(())
    }

    /// Record allocation granularity
    pub fn set_extent_size(&mut self, size: u64) {
        self.extent_size = size;
    }

    /// Apply a new physical size, keeping `used` untouched
    pub fn resize(&mut self, new_total: u64) -> Result<()> {
        let free = new_total
            .checked_sub(self.storage.used)
            .ok_or_else(|| Error::NegativeFreeSpace {
                device_id: self.id.clone(),
                total: new_total,
                used: self.storage.used,
            })?;
        self.storage.total = new_total;
        self.storage.free = free;
        Ok(())
    }

    /// Validate a state change and report what the allocator must do
    pub fn set_state(&mut self, to: DeviceState) -> Result<PoolChange> {
        use DeviceState::*;

        if self.state == to {
            return Ok(PoolChange::Unchanged);
        }

        let change = match (self.state, to) {
            (Online, Offline) | (Online, Failed) => PoolChange::Exclude,
            (Offline, Failed) => PoolChange::Unchanged,
            (Offline, Online) | (Failed, Online) => PoolChange::Include,
            (from, to) => {
                return Err(Error::InvalidStateTransition {
                    device_id: self.id.clone(),
                    from,
                    to,
                })
            }
        };

        self.state = to;
        Ok(change)
    }

    /// Put back a state recorded before a failed change
    pub(crate) fn restore_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    /// Check if the device can be removed
    ///
    /// `last_in_zone` is true when this device is the last placement-eligible
    /// device of its failure domain while the cluster still holds data.
    pub fn is_delete_ok(&self, last_in_zone: bool) -> bool {
        self.storage.used == 0 && !last_in_zone
    }

    /// Describe why the device cannot be removed
    pub fn conflict_string(&self, last_in_zone: bool) -> String {
        if self.storage.used > 0 {
            format!(
                "Unable to delete device [{}] because it contains {} bytes of allocated data",
                self.id, self.storage.used
            )
        } else if last_in_zone {
            format!(
                "Unable to delete device [{}] because it is the last device of its failure domain",
                self.id
            )
        } else {
            String::new()
        }
    }

    /// Build the external description
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            node_id: self.node_id.clone(),
            state: self.state,
            storage: self.storage,
            extent_size: self.extent_size,
        }
    }
}
