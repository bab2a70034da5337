//! Topology Events
//!
//! Events emitted after committed device changes so in-process consumers
//! can react without polling the store.

use super::device::DeviceState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyEvent {
    /// A device was provisioned and linked into its node
    DeviceAdded {
        node_id: String,
        device_id: String,
        total_bytes: u64,
    },

    /// A device was torn down and removed
    DeviceRemoved { node_id: String, device_id: String },

    /// A device changed operational state
    DeviceStateChanged {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
    },

    /// Resync applied a new physical size
    DeviceResized {
        node_id: String,
        device_id: String,
        old_total: u64,
        new_total: u64,
    },
}

impl TopologyEvent {
    /// Get the device ID associated with this event
    pub fn device_id(&self) -> &str {
        match self {
            TopologyEvent::DeviceAdded { device_id, .. } => device_id,
            TopologyEvent::DeviceRemoved { device_id, .. } => device_id,
            TopologyEvent::DeviceStateChanged { device_id, .. } => device_id,
            TopologyEvent::DeviceResized { device_id, .. } => device_id,
        }
    }
}

/// Send an event to current subscribers; having none is not an error
pub fn publish(events: &broadcast::Sender<TopologyEvent>, event: TopologyEvent) {
    debug!(device_id = event.device_id(), ?event, "Topology event");
    let _ = events.send(event);
}
