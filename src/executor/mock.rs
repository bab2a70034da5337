//! Mock Device Executor
//!
//! Simulates storage hosts in memory. Sizes are configurable per device and
//! failures can be injected per operation, which is what the orchestrator
//! tests rely on to exercise compensation paths.

use crate::domain::ports::{DeviceExecutor, PhysicalDevice};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the mock executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockExecutorConfig {
    /// Size reported for devices without an override
    pub device_size_bytes: u64,
    /// Extent size reported for every device
    pub extent_size_bytes: u64,
}

impl Default for MockExecutorConfig {
    fn default() -> Self {
        Self {
            device_size_bytes: 500 * MIB,
            extent_size_bytes: 4 * MIB,
        }
    }
}

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Setup,
    Teardown,
    Info,
}

impl MockOperation {
    fn as_str(&self) -> &'static str {
        match self {
            MockOperation::Setup => "device_setup",
            MockOperation::Teardown => "device_teardown",
            MockOperation::Info => "get_device_info",
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct CallCounters {
    setup: AtomicU64,
    teardown: AtomicU64,
    info: AtomicU64,
}

/// Call counts per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockExecutorStats {
    pub setup_calls: u64,
    pub teardown_calls: u64,
    pub info_calls: u64,
    pub provisioned: usize,
}

// =============================================================================
// Mock Executor
// =============================================================================

/// In-memory executor for development and tests
pub struct MockExecutor {
    config: MockExecutorConfig,
    /// Size overrides keyed by (host, device name)
    sizes: Mutex<HashMap<(String, String), u64>>,
    /// Injected failures and their messages
    failures: Mutex<HashMap<MockOperation, String>>,
    /// Device ids currently set up
    provisioned: Mutex<HashSet<String>>,
    /// Paused operations; calls wait until the gate is closed
    gates: Mutex<HashMap<MockOperation, Arc<Semaphore>>>,
    calls: CallCounters,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new(MockExecutorConfig::default())
    }
}

impl MockExecutor {
    pub fn new(config: MockExecutorConfig) -> Self {
        Self {
            config,
            sizes: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            provisioned: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            calls: CallCounters::default(),
        }
    }

    /// Report `size` for one device from now on
    pub fn set_device_size(&self, host: &str, device: &str, size: u64) {
        self.sizes
            .lock()
            .insert((host.to_string(), device.to_string()), size);
    }

    /// Make every call of `operation` fail with `reason`
    pub fn fail(&self, operation: MockOperation, reason: impl Into<String>) {
        self.failures.lock().insert(operation, reason.into());
    }

    pub fn clear_failure(&self, operation: MockOperation) {
        self.failures.lock().remove(&operation);
    }

    /// Hold every call of `operation` until [`MockExecutor::resume`]
    pub fn pause(&self, operation: MockOperation) {
        self.gates
            .lock()
            .entry(operation)
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Release calls held by [`MockExecutor::pause`]
    pub fn resume(&self, operation: MockOperation) {
        if let Some(gate) = self.gates.lock().remove(&operation) {
            gate.close();
        }
    }

    /// Check whether a device is currently set up
    pub fn is_provisioned(&self, id: &str) -> bool {
        self.provisioned.lock().contains(id)
    }

    pub fn stats(&self) -> MockExecutorStats {
        MockExecutorStats {
            setup_calls: self.calls.setup.load(Ordering::Relaxed),
            teardown_calls: self.calls.teardown.load(Ordering::Relaxed),
            info_calls: self.calls.info.load(Ordering::Relaxed),
            provisioned: self.provisioned.lock().len(),
        }
    }

    async fn wait_gate(&self, operation: MockOperation) {
        let gate = self.gates.lock().get(&operation).cloned();
        if let Some(gate) = gate {
            debug!(operation = operation.as_str(), "Call paused");
            // Closing the gate fails the acquire and lets the call through
            let _ = gate.acquire().await;
        }
    }

    fn check_failure(&self, operation: MockOperation, host: &str) -> Result<()> {
        match self.failures.lock().get(&operation) {
            Some(reason) => Err(Error::Executor {
                operation: operation.as_str().to_string(),
                host: host.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn physical(&self, host: &str, device: &str) -> PhysicalDevice {
        let size = self
            .sizes
            .lock()
            .get(&(host.to_string(), device.to_string()))
            .copied()
            .unwrap_or(self.config.device_size_bytes);
        PhysicalDevice {
            size,
            extent_size: self.config.extent_size_bytes,
        }
    }
}

#[async_trait]
impl DeviceExecutor for MockExecutor {
    async fn device_setup(&self, host: &str, device: &str, id: &str) -> Result<PhysicalDevice> {
        self.calls.setup.fetch_add(1, Ordering::Relaxed);
        self.wait_gate(MockOperation::Setup).await;
        self.check_failure(MockOperation::Setup, host)?;

        let physical = self.physical(host, device);
        self.provisioned.lock().insert(id.to_string());
        info!(
            "Set up device {} ({}) on {}: {} bytes",
            device, id, host, physical.size
        );
        Ok(physical)
    }

    async fn device_teardown(&self, host: &str, device: &str, id: &str) -> Result<()> {
        self.calls.teardown.fetch_add(1, Ordering::Relaxed);
        self.wait_gate(MockOperation::Teardown).await;
        self.check_failure(MockOperation::Teardown, host)?;

        self.provisioned.lock().remove(id);
        info!("Tore down device {} ({}) on {}", device, id, host);
        Ok(())
    }

    async fn get_device_info(&self, host: &str, device: &str, id: &str) -> Result<PhysicalDevice> {
        self.calls.info.fetch_add(1, Ordering::Relaxed);
        self.wait_gate(MockOperation::Info).await;
        self.check_failure(MockOperation::Info, host)?;

        let physical = self.physical(host, device);
        debug!(device, id, host, size = physical.size, "Reported device info");
        Ok(physical)
    }

    fn name(&self) -> &str {
        "mock"
    }
}
