//! vane.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaneConfig {
    pub controller: ControllerConfig,
    pub backoff: BackoffConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,
    /// Full cache relist interval (e.g. "5m").
    pub resync_interval: String,
    /// Default timeout for a single metric measurement.
    pub measurement_timeout: String,
    /// Timeout for a single traffic router call.
    pub router_timeout: String,
    /// Mirror replica set spec into status (no workload controller present).
    pub simulate_readiness: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: "5m".to_string(),
            measurement_timeout: "30s".to_string(),
            router_timeout: "10s".to_string(),
            simulate_readiness: false,
        }
    }
}

/// Per-key exponential backoff for failed reconciles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base: String,
    pub max: String,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: "500ms".to_string(),
            max: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the object store; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(PathBuf::from("/var/lib/vane")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,vane=debug".to_string(),
            json: false,
        }
    }
}

impl VaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VaneConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every duration field parses and limits are sane.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.controller.workers == 0 {
            anyhow::bail!("controller.workers must be at least 1");
        }
        if self.resync_interval()?.is_zero() {
            anyhow::bail!("controller.resync_interval must be positive");
        }
        self.measurement_timeout()?;
        self.router_timeout()?;
        let (base, max) = self.backoff()?;
        if base > max {
            anyhow::bail!("backoff.base ({base:?}) exceeds backoff.max ({max:?})");
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.controller.resync_interval)?)
    }

    pub fn measurement_timeout(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.controller.measurement_timeout)?)
    }

    pub fn router_timeout(&self) -> anyhow::Result<Duration> {
        Ok(parse_duration(&self.controller.router_timeout)?)
    }

    /// Backoff (base, max).
    pub fn backoff(&self) -> anyhow::Result<(Duration, Duration)> {
        Ok((
            parse_duration(&self.backoff.base)?,
            parse_duration(&self.backoff.max)?,
        ))
    }
}
