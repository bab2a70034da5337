//! Allocator Adapters
//!
//! The placement pool is the in-process allocator: it tracks eligibility
//! and zone membership for every device the orchestrator hands it.

pub mod pool;

pub use pool::*;
