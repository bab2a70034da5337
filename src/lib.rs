//! Storage Topology Manager
//!
//! Control plane for a distributed storage cluster: tracks the devices
//! attached to member nodes, provisions and decommissions them on remote
//! hosts, and keeps persisted capacity consistent with the hardware.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              REST API (axum)                                │
//! │            /clusters   /nodes   /devices   /queue/{job}                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                      Device Lifecycle Orchestrator                          │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Job Manager   │  │      Saga       │  │     Resync Reconciler       │  │
//! │  │  (async jobs)   │  │ (compensations) │  │ (snapshot/query/apply)      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                  │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │    Topology Store     │                                │
//! │                    │ (copy-on-write, 1 wr) │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │    Device Executor port     │  │        Device Allocator port        │   │
//! │  │  (mock executor shipped)    │  │   (placement pool shipped)          │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`topology`]: Store and cluster/node/device entries
//! - [`controlplane`]: Orchestrator, jobs, sagas, resync and the REST API
//! - [`domain`]: Executor and allocator ports, request types
//! - [`allocation`]: In-memory placement pool
//! - [`executor`]: Mock executor
//! - [`config`]: Service configuration
//! - [`error`]: Error types and handling

pub mod allocation;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod executor;
pub mod topology;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, JobManager, JobStatus, OperationMetrics, Orchestrator,
    OrchestratorConfig, OrchestratorStatus, RestRouter, Saga, TopologyReconciler,
};

pub use domain::ports::{
    DeviceAddRequest, DeviceAllocator, DeviceAllocatorRef, DeviceExecutor, DeviceExecutorRef,
    NodeAddRequest, PhysicalDevice, StateRequest,
};

pub use error::{EntityKind, Error, ErrorKind, Result};

pub use topology::{
    ClusterEntry, DeviceEntry, DeviceInfo, DeviceState, NodeEntry, NodeInfo, TopologyEvent,
    TopologyStore,
};

pub use allocation::PlacementPool;
pub use config::ServiceConfig;
pub use executor::{ExecutorFactory, MockExecutor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
