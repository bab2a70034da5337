//! Service Configuration
//!
//! Settings are read from an optional YAML file; command-line flags and
//! environment variables override individual fields in `main`.

use crate::controlplane::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::executor::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

mod defaults {
    pub fn api_addr() -> String {
        "0.0.0.0:8080".to_string()
    }
    pub fn health_addr() -> String {
        "0.0.0.0:8081".to_string()
    }
    pub fn metrics_addr() -> String {
        "0.0.0.0:9090".to_string()
    }
    pub fn log_level() -> String {
        "info".to_string()
    }

    pub fn compensation_retry_ms() -> u64 {
        5000
    }
    pub fn job_retention_secs() -> u64 {
        3600
    }
    pub fn job_prune_interval_secs() -> u64 {
        60
    }
}

/// Orchestrator timing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// How long a failing compensation is retried
    #[serde(default = "defaults::compensation_retry_ms")]
    pub compensation_retry_ms: u64,
    /// How long finished jobs remain queryable
    #[serde(default = "defaults::job_retention_secs")]
    pub job_retention_secs: u64,
    /// How often finished jobs are pruned
    #[serde(default = "defaults::job_prune_interval_secs")]
    pub job_prune_interval_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            compensation_retry_ms: defaults::compensation_retry_ms(),
            job_retention_secs: defaults::job_retention_secs(),
            job_prune_interval_secs: defaults::job_prune_interval_secs(),
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "defaults::api_addr")]
    pub api_addr: String,
    #[serde(default = "defaults::health_addr")]
    pub health_addr: String,
    #[serde(default = "defaults::metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_addr: defaults::api_addr(),
            health_addr: defaults::health_addr(),
            metrics_addr: defaults::metrics_addr(),
            log_level: defaults::log_level(),
            log_json: false,
            executor: ExecutorConfig::default(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Check addresses and timings
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("api_addr", &self.api_addr),
            ("health_addr", &self.health_addr),
            ("metrics_addr", &self.metrics_addr),
        ] {
            parse_addr(name, addr)?;
        }
        if self.orchestrator.job_prune_interval_secs == 0 {
            return Err(Error::Configuration(
                "job_prune_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn api_socket_addr(&self) -> Result<SocketAddr> {
        parse_addr("api_addr", &self.api_addr)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            compensation_retry: Duration::from_millis(self.orchestrator.compensation_retry_ms),
            job_retention: Duration::from_secs(self.orchestrator.job_retention_secs),
        }
    }

    pub fn job_prune_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.job_prune_interval_secs)
    }
}

fn parse_addr(name: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} '{}': {}", name, addr, e)))
}
