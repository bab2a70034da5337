//! API Module
//!
//! Provides the REST API for cluster, node and device lifecycle management
//! and the job queue used to poll long-running operations.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
