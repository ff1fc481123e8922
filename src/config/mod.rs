//! # Configuration Management
//!
//! Environment-aware configuration for the worker node. Values load from an
//! optional `analyst.toml` file plus `ANALYST_`-prefixed environment variable
//! overrides, with sane defaults for every field so a bare node can start
//! without any configuration at all.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{AnalystError, Result};

/// Worker pool and task polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of concurrent task execution slots
    pub worker_threads: usize,
    /// Whether this node accepts work at all (a node can be registered
    /// with the coordinator but not executing)
    pub execute_enabled: bool,
    /// Interval between pending-task polls, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            execute_enabled: true,
            poll_interval_ms: 5000,
        }
    }
}

/// Pipeline cache eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineCacheConfig {
    /// Inactivity window after which a cached pipeline is evicted, in seconds
    pub inactivity_window_secs: u64,
    /// Interval between eviction sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for PipelineCacheConfig {
    fn default() -> Self {
        Self {
            inactivity_window_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Coordinator connectivity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Coordinator host list; shuffled on each refresh to spread load
    /// across coordinator replicas
    pub hosts: Vec<String>,
    /// Minimum interval between host list refreshes, in milliseconds
    pub host_refresh_interval_ms: u64,
    /// Backoff window applied to a host after a connection failure,
    /// in milliseconds
    pub host_backoff_ms: u64,
    /// Address this node advertises to the coordinator
    pub node_addr: String,
    /// Request timeout for coordinator calls, in milliseconds
    pub timeout_ms: u64,
    /// Optional bearer token for coordinator calls
    pub auth_token: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["http://localhost:8066".to_string()],
            host_refresh_interval_ms: 5000,
            host_backoff_ms: 60_000,
            node_addr: "http://localhost:8099".to_string(),
            timeout_ms: 30_000,
            auth_token: None,
        }
    }
}

/// Local object store configuration for materialized remote assets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the local object store
    pub object_store_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_store_root: PathBuf::from("data/objects"),
        }
    }
}

/// Top-level configuration for a worker node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalystConfig {
    pub executor: ExecutorConfig,
    pub cache: PipelineCacheConfig,
    pub coordinator: CoordinatorConfig,
    pub storage: StorageConfig,
}

impl AnalystConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.executor.poll_interval_ms)
    }

    pub fn cache_inactivity_window(&self) -> Duration {
        Duration::from_secs(self.cache.inactivity_window_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }

    pub fn host_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.host_refresh_interval_ms)
    }

    pub fn host_backoff(&self) -> Duration {
        Duration::from_millis(self.coordinator.host_backoff_ms)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<()> {
        if self.executor.worker_threads == 0 {
            return Err(AnalystError::ConfigurationError(
                "executor.worker_threads must be greater than zero".to_string(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(AnalystError::ConfigurationError(
                "cache.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration manager wrapping the loaded configuration with its
/// detected environment
pub struct ConfigManager {
    config: AnalystConfig,
    environment: String,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_file(Path::new("analyst.toml"))
    }

    /// Load configuration from a specific file (the file is optional; missing
    /// files fall back to defaults plus environment overrides)
    pub fn load_from_file(path: &Path) -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();

        debug!(
            environment = %environment,
            path = %path.display(),
            "Loading worker node configuration"
        );

        let config: AnalystConfig = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("ANALYST").separator("__"))
            .build()
            .map_err(|e| AnalystError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AnalystError::ConfigurationError(e.to_string()))?;

        config.validate()?;

        Ok(Arc::new(ConfigManager {
            config,
            environment,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &AnalystConfig {
        &self.config
    }

    /// Get the detected environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn detect_environment() -> String {
        std::env::var("ANALYST_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
