//! Topology Model
//!
//! Persisted cluster, node and device rows on top of a transactional
//! copy-on-write store.

pub mod cluster;
pub mod device;
pub mod events;
pub mod node;
pub mod store;

pub use cluster::*;
pub use device::*;
pub use events::*;
pub use node::*;
pub use store::*;

/// Generate a random entity id (32 lowercase hex characters)
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
