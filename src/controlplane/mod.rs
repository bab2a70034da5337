//! Control Plane Module
//!
//! The device lifecycle orchestrator and everything it leans on: the job
//! manager, compensating sagas, the resync reconciler, metrics and the
//! REST API.

pub mod api;
pub mod jobs;
pub mod metrics;
pub mod orchestrator;
pub mod resync;
pub mod saga;

pub use api::*;
pub use jobs::*;
pub use metrics::*;
pub use orchestrator::*;
pub use resync::*;
pub use saga::*;
