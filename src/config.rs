use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_GID_INDEX, DEFAULT_HOP_LIMIT, DEFAULT_IB_PORT, DEFAULT_POLL_BATCH,
    DEFAULT_SERVICE_LEVEL, DEFAULT_TOTAL_OPS, DEFAULT_WARMUP_OPS,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/ib-echo/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Device and port selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name, the first device is used when absent
    pub name: Option<String>,
    pub ib_port: u8,
    pub gid_index: u8,
    pub service_level: u8,
    pub hop_limit: u8,
    /// Completion queue depth, the device maximum when absent
    pub cq_depth: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            ib_port: DEFAULT_IB_PORT,
            gid_index: DEFAULT_GID_INDEX,
            service_level: DEFAULT_SERVICE_LEVEL,
            hop_limit: DEFAULT_HOP_LIMIT,
            cq_depth: None,
        }
    }
}

/// Steady-state loop parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Operations ignored before the timer starts
    pub warmup_ops: u64,
    /// Operations after which the server sends STOP, must be positive
    pub total_ops: u64,
    /// Completions fetched per poll
    pub poll_batch: usize,
    /// Core the worker is pinned to
    pub core: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            warmup_ops: DEFAULT_WARMUP_OPS,
            total_ops: DEFAULT_TOTAL_OPS,
            poll_batch: DEFAULT_POLL_BATCH,
            core: 0,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub device: DeviceConfig,
    pub run: RunConfig,
}

impl BenchConfig {
    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn run(&self) -> &RunConfig {
        &self.run
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the default path, falling back to
    /// defaults when the file does not exist.
    pub fn load_default() -> Result<BenchConfig, ConfigError> {
        if !Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Ok(BenchConfig::default());
        }
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads the configuration from the specified path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<BenchConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BenchConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: BenchConfig = toml::from_str("").unwrap();
        assert_eq!(config, BenchConfig::default());
        assert_eq!(config.run.warmup_ops, 500_000);
        assert_eq!(config.device.ib_port, 1);
        assert_eq!(config.device.gid_index, 3);
    }

    #[test]
    fn partial_override() {
        let config: BenchConfig = toml::from_str(
            r#"
            [device]
            name = "mlx5_0"
            cq_depth = 1024

            [run]
            warmup_ops = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.device.name.as_deref(), Some("mlx5_0"));
        assert_eq!(config.device.cq_depth, Some(1024));
        assert_eq!(config.device.hop_limit, 255);
        assert_eq!(config.run.warmup_ops, 10);
        assert_eq!(config.run.total_ops, 5_000_000);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ConfigLoader::load_from_path("/nonexistent/ib-echo.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
