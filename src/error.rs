//! Error types for the Storage Topology Manager
//!
//! Provides structured error types for the topology store, the device
//! lifecycle orchestrator, the resync reconciler and their collaborators.
//! Every variant maps onto one [`ErrorKind`], which drives retry decisions
//! and the HTTP status returned to callers.

use crate::topology::DeviceState;
use thiserror::Error;

// =============================================================================
// Entity Kind
// =============================================================================

/// Kind of entity referenced by a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Cluster,
    Node,
    Device,
    Job,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Cluster => write!(f, "cluster"),
            EntityKind::Node => write!(f, "node"),
            EntityKind::Device => write!(f, "device"),
            EntityKind::Job => write!(f, "job"),
        }
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the topology manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    // =========================================================================
    // Topology Errors
    // =========================================================================
    #[error("Id not found: {kind} {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state transition for device {device_id}: {from} -> {to}")]
    InvalidStateTransition {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
    },

    #[error("Negative free space on device {device_id}: total {total} bytes, used {used} bytes")]
    NegativeFreeSpace {
        device_id: String,
        total: u64,
        used: u64,
    },

    #[error("Topology consistency fault: {0}")]
    ConsistencyFault(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Executor {operation} failed on {host}: {reason}")]
    Executor {
        operation: String,
        host: String,
        reason: String,
    },

    #[error("Allocator error: {0}")]
    Allocator(String),

    // =========================================================================
    // Encoding / IO Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy shared by the orchestrator and its callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidStateTransition,
    ExternalOperation,
    ConsistencyFault,
    Validation,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::InvalidStateTransition => write!(f, "invalid_state_transition"),
            ErrorKind::ExternalOperation => write!(f, "external_operation_failure"),
            ErrorKind::ConsistencyFault => write!(f, "consistency_fault"),
            ErrorKind::Validation => write!(f, "invalid_request"),
            ErrorKind::Internal => write!(f, "internal_error"),
        }
    }
}

impl Error {
    /// Shorthand for a missing entity
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,

            // Negative free space means persisted usage exceeds what the
            // hardware reports; it is refused like any other invariant breach.
            Error::Conflict(_) | Error::NegativeFreeSpace { .. } => ErrorKind::Conflict,

            Error::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,

            Error::Executor { .. } | Error::Allocator(_) => ErrorKind::ExternalOperation,

            Error::ConsistencyFault(_) => ErrorKind::ConsistencyFault,

            Error::Validation(_) => ErrorKind::Validation,

            Error::Internal(_)
            | Error::Configuration(_)
            | Error::Serialization(_)
            | Error::ConfigParse(_)
            | Error::Metrics(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error refers to a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is retryable
    ///
    /// Only collaborator failures are worth retrying; everything else is
    /// deterministic given the current topology.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ExternalOperation)
    }
}

/// Result type alias for the topology manager
pub type Result<T> = std::result::Result<T, Error>;
