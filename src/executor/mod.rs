//! Device Executor Adapters
//!
//! Concrete implementations of the executor port. Only the in-memory mock
//! ships here; real transports live outside this crate.

pub mod mock;

pub use mock::*;

use crate::domain::ports::DeviceExecutorRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Executor selection and settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: String,
    pub mock: MockExecutorConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: "mock".to_string(),
            mock: MockExecutorConfig::default(),
        }
    }
}

/// Factory for creating executor adapters
pub struct ExecutorFactory;

impl ExecutorFactory {
    /// Create an executor by kind
    pub fn create(config: &ExecutorConfig) -> Result<DeviceExecutorRef> {
        match config.kind.to_lowercase().as_str() {
            "mock" => Ok(Arc::new(MockExecutor::new(config.mock.clone()))),
            other => Err(Error::Configuration(format!(
                "unsupported executor kind: {}",
                other
            ))),
        }
    }
}
