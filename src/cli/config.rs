use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Worker configuration, read once at startup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Controller address, `host:port` or a full `ws://` / `wss://` URL
    #[serde(alias = "Address")]
    pub address: String,
    /// Seconds to wait before every dial attempt
    #[serde(alias = "Interval")]
    pub interval: f64,
    /// Shared data file transfer
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Assertion script limits
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    /// Where received archive chunks are written
    pub archive_path: PathBuf,
    /// Directory the archive is extracted into
    pub extract_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            archive_path: PathBuf::from("./global_data.zip"),
            extract_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// JS heap limit per evaluation in bytes
    pub memory_limit: usize,
    pub max_stack_size: usize,
    /// Wall clock budget per evaluation
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            max_stack_size: 1024 * 1024,
            timeout_ms: 5000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:11010".to_string(),
            interval: 5.0,
            transfer: TransferConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".into()));
        }
        if self.interval <= 0.0 || Duration::try_from_secs_f64(self.interval).is_err() {
            return Err(ConfigError::Invalid(format!(
                "interval must be a positive number of seconds, got {}",
                self.interval
            )));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::Invalid("sandbox.timeoutMs must be > 0".into()));
        }
        Ok(())
    }

    /// Falls back to the default interval for values `validate` would reject.
    pub fn retry_interval(&self) -> Duration {
        match Duration::try_from_secs_f64(self.interval) {
            Ok(d) if !d.is_zero() => d,
            _ => Duration::from_secs_f64(Config::default().interval),
        }
    }

    /// WebSocket URL of the controller. `ws://` is assumed when the address has no scheme.
    pub fn controller_url(&self) -> String {
        let address = self.address.trim();
        if address.contains("://") {
            address.to_string()
        } else {
            format!("ws://{address}")
        }
    }
}
