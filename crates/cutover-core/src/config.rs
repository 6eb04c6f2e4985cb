//! cutover.toml configuration parser.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below, so an empty file is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid health policy: {0}")]
    InvalidPolicy(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CutoverConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    /// Default policy for deployment requests that do not carry one.
    pub policy: HealthPolicy,
    pub retry: RetryPolicy,
    pub task_sets: TaskSetConfig,
    pub probe: ProbeConfig,
    pub sweep: SweepConfig,
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8480)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/cutover"),
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("cutover.redb")
    }
}

/// Upper bound for every duration in a [`HealthPolicy`].
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_EVALUATION_WINDOW: u32 = 10_000;

/// What "healthy" means for a candidate task set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Fraction of desired instances that must pass (1.0 = all).
    pub min_healthy_fraction: f64,
    /// Consecutive passing probe cycles required.
    pub evaluation_window: u32,
    #[serde(with = "serde_str")]
    pub probe_interval: Duration,
    #[serde(with = "serde_str")]
    pub probe_timeout: Duration,
    /// Budget for each waiting state before the deployment is rolled back.
    #[serde(with = "serde_str")]
    pub deployment_timeout: Duration,
    /// Convergence window after a traffic shift before health is re-checked.
    #[serde(with = "serde_str")]
    pub propagation_grace_period: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            min_healthy_fraction: 1.0,
            evaluation_window: 3,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            deployment_timeout: Duration::from_secs(600),
            propagation_grace_period: Duration::from_secs(30),
        }
    }
}

impl HealthPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidPolicy(msg));
        if !(self.min_healthy_fraction > 0.0 && self.min_healthy_fraction <= 1.0) {
            return invalid("min_healthy_fraction must be in (0, 1]".to_string());
        }
        if self.evaluation_window == 0 {
            return invalid("evaluation_window must be at least 1".to_string());
        }
        if self.evaluation_window > MAX_EVALUATION_WINDOW {
            return invalid(format!("evaluation_window must not exceed {MAX_EVALUATION_WINDOW}"));
        }
        let durations = [
            ("probe_interval", self.probe_interval),
            ("probe_timeout", self.probe_timeout),
            ("deployment_timeout", self.deployment_timeout),
            ("propagation_grace_period", self.propagation_grace_period),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return invalid(format!("{name} must be non-zero"));
            }
            if value > MAX_POLICY_DURATION {
                return invalid(format!("{name} must not exceed {MAX_POLICY_DURATION:?}"));
            }
        }
        if self.probe_timeout > self.probe_interval {
            return invalid("probe_timeout must not exceed probe_interval".to_string());
        }
        Ok(())
    }

    /// Instances that must pass for a cycle to count, given `expected`.
    pub fn required_healthy(&self, expected: u32) -> u32 {
        ((self.min_healthy_fraction * f64::from(expected)) - 1e-9).ceil().max(0.0) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSetConfig {
    /// Bound on a single status call before cached data is served.
    #[serde(with = "serde_str")]
    pub status_timeout: Duration,
    /// Instance count when a service has no live task set yet.
    pub default_desired_count: u32,
}

impl Default for TaskSetConfig {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(2),
            default_desired_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Ask the in-process platform; its instances have no real endpoint.
    #[default]
    Simulated,
    /// HTTP GET against each instance address.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub mode: ProbeMode,
    /// HTTP path probed on every instance.
    pub path: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            path: "/healthz".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Settings for the in-process platform used in standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Maximum instances the simulated fleet can run at once.
    pub capacity: u32,
    /// Time a simulated instance takes to start.
    #[serde(with = "serde_str")]
    pub startup_delay: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            startup_delay: Duration::from_secs(1),
        }
    }
}

impl CutoverConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: CutoverConfig = toml::from_str(content)?;
        config.policy.validate()?;
        Ok(config)
    }
}
