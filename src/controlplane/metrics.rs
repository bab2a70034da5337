//! Operation Metrics
//!
//! Prometheus counters for lifecycle operations. Each instance owns its own
//! registry so that tests and multiple orchestrators never collide on the
//! process-global default registry.

use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Outcome label for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Failed after side effects began
    Failed,
    /// Refused before anything changed
    Rejected,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Rejected => "rejected",
        }
    }
}

/// Counters exported by the orchestrator
pub struct OperationMetrics {
    registry: Registry,
    operations: IntCounterVec,
    compensations: IntCounterVec,
    devices_resynced: IntCounter,
    consistency_faults: IntCounter,
}

impl std::fmt::Debug for OperationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationMetrics").finish_non_exhaustive()
    }
}

impl OperationMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "topology_operations_total",
                "Lifecycle operations by type and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let compensations = IntCounterVec::new(
            Opts::new(
                "topology_compensations_total",
                "Compensating actions by outcome",
            ),
            &["outcome"],
        )?;
        let devices_resynced = IntCounter::new(
            "topology_devices_resynced_total",
            "Devices whose capacity was updated by resync",
        )?;
        let consistency_faults = IntCounter::new(
            "topology_consistency_faults_total",
            "Detected topology consistency faults",
        )?;

        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(compensations.clone()))?;
        registry.register(Box::new(devices_resynced.clone()))?;
        registry.register(Box::new(consistency_faults.clone()))?;

        Ok(Arc::new(Self {
            registry,
            operations,
            compensations,
            devices_resynced,
            consistency_faults,
        }))
    }

    pub fn record_operation(&self, operation: &str, outcome: Outcome) {
        self.operations
            .with_label_values(&[operation, outcome.as_str()])
            .inc();
    }

    pub fn record_compensations(&self, succeeded: usize, failed: usize) {
        self.compensations
            .with_label_values(&["succeeded"])
            .inc_by(succeeded as u64);
        self.compensations
            .with_label_values(&["failed"])
            .inc_by(failed as u64);
    }

    pub fn record_devices_resynced(&self, count: usize) {
        self.devices_resynced.inc_by(count as u64);
    }

    pub fn record_consistency_fault(&self) {
        self.consistency_faults.inc();
    }

    /// Current value of one operation counter
    pub fn operation_count(&self, operation: &str, outcome: Outcome) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome.as_str()])
            .get()
    }

    pub fn consistency_faults(&self) -> u64 {
        self.consistency_faults.get()
    }

    pub fn devices_resynced(&self) -> u64 {
        self.devices_resynced.get()
    }

    /// Render every metric in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
