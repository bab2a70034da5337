//! Domain Ports - Core trait definitions for the topology manager
//!
//! These traits define the boundaries between the device lifecycle logic and
//! external systems. Adapters implement these traits to provide concrete
//! functionality: the executor reaches storage hosts, the allocator places
//! data across devices.

use crate::error::{Error, Result};
use crate::topology::{ClusterEntry, DeviceEntry, DeviceState, Hostnames, NodeEntry, DEFAULT_ZONE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Executor Types
// =============================================================================

/// Physical characteristics reported by a storage host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalDevice {
    /// Usable size in bytes
    pub size: u64,
    /// Allocation granularity in bytes
    pub extent_size: u64,
}

// =============================================================================
// Executor Port
// =============================================================================

/// Port for operations on remote storage hosts
#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    /// Prepare a raw device for use and report its size
    async fn device_setup(&self, host: &str, device: &str, id: &str) -> Result<PhysicalDevice>;

    /// Release a device on its host
    async fn device_teardown(&self, host: &str, device: &str, id: &str) -> Result<()>;

    /// Report the current physical size of a provisioned device
    async fn get_device_info(&self, host: &str, device: &str, id: &str) -> Result<PhysicalDevice>;

    /// Get executor name
    fn name(&self) -> &str;
}

// =============================================================================
// Allocator Port
// =============================================================================

/// Port for the capacity allocator
///
/// Every operation is idempotent: adding a known device updates it,
/// removing an unknown device succeeds.
#[async_trait]
pub trait DeviceAllocator: Send + Sync {
    /// Make a device known to the allocator
    async fn add_device(
        &self,
        cluster: &ClusterEntry,
        node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()>;

    /// Forget a device
    async fn remove_device(
        &self,
        cluster: &ClusterEntry,
        node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()>;

    /// Make a known device eligible for placement again
    async fn include_device(
        &self,
        cluster: &ClusterEntry,
        node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()>;

    /// Stop placing data on a device
    async fn exclude_device(
        &self,
        cluster: &ClusterEntry,
        node: &NodeEntry,
        device: &DeviceEntry,
    ) -> Result<()>;

    /// Placement-eligible device ids of one failure domain
    async fn zone_members(&self, cluster_id: &str, zone: u32) -> Result<Vec<String>>;
}

// =============================================================================
// Requests
// =============================================================================

/// Request to add a device to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAddRequest {
    pub node_id: String,
    pub name: String,
}

impl DeviceAddRequest {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("device name is required".into()));
        }
        if self.node_id.trim().is_empty() {
            return Err(Error::Validation("node id is required".into()));
        }
        Ok(())
    }
}

/// Request to add a node to a cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAddRequest {
    pub cluster_id: String,
    pub hostnames: Hostnames,
    #[serde(default = "default_zone")]
    pub zone: u32,
}

fn default_zone() -> u32 {
    DEFAULT_ZONE
}

impl NodeAddRequest {
    pub fn validate(&self) -> Result<()> {
        let blank = |hosts: &[String]| hosts.is_empty() || hosts.iter().any(|h| h.trim().is_empty());
        if blank(&self.hostnames.manage) {
            return Err(Error::Validation("manage hostnames are required".into()));
        }
        if blank(&self.hostnames.storage) {
            return Err(Error::Validation("storage hostnames are required".into()));
        }
        if self.zone == 0 {
            return Err(Error::Validation("zone must be at least 1".into()));
        }
        Ok(())
    }
}

/// Request to change the operational state of a device
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StateRequest {
    pub state: DeviceState,
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DeviceExecutorRef = Arc<dyn DeviceExecutor>;
pub type DeviceAllocatorRef = Arc<dyn DeviceAllocator>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_device_add_request_validation() {
        let req = DeviceAddRequest {
            node_id: "n1".into(),
            name: "".into(),
        };
        assert_matches!(req.validate(), Err(Error::Validation(_)));

        let req = DeviceAddRequest {
            node_id: "n1".into(),
            name: "/dev/sdb".into(),
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_node_add_request_defaults_zone() {
        let req: NodeAddRequest = serde_json::from_str(
            r#"{"clusterId":"c1","hostnames":{"manage":["m"],"storage":["s"]}}"#,
        )
        .unwrap();
        assert_eq!(req.zone, DEFAULT_ZONE);
        assert!(req.validate().is_ok());

        let req: NodeAddRequest =
            serde_json::from_str(r#"{"clusterId":"c1","hostnames":{"manage":["m"]}}"#).unwrap();
        assert_matches!(req.validate(), Err(Error::Validation(_)));
    }

    #[test]
    fn test_state_request_parse() {
        let req: StateRequest = serde_json::from_str(r#"{"state":"offline"}"#).unwrap();
        assert_eq!(req.state, DeviceState::Offline);
    }
}
