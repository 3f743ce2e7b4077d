//! Configuration management for the vrecon CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use vrecon_core::{DomainStartPolicy, NetworkPolicy, ReconcilerConfig, ShutdownPolicy};

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vrecon/vrecon.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor connection
    pub hypervisor: HypervisorConfig,
    /// Graceful shutdown timing for domain delete
    pub shutdown: ShutdownConfig,
    /// What happens to a domain after it is created
    pub domain: DomainConfig,
    /// Network-specific behavior
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file deserializes to unit, not to an empty map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.uri {
            self.hypervisor.uri = uri.clone();
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.json_logs {
            self.logging.json = true;
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hypervisor.backend == HypervisorBackend::Libvirt && self.hypervisor.uri.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "hypervisor.uri".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        if self.shutdown.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "shutdown.timeout_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.shutdown.min_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "shutdown.min_interval_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.shutdown.min_interval_secs > self.shutdown.timeout_secs {
            return Err(ConfigError::InvalidValue {
                field: "shutdown.min_interval_secs".to_string(),
                message: format!(
                    "must not exceed shutdown.timeout_secs ({})",
                    self.shutdown.timeout_secs
                ),
            });
        }

        if self.shutdown.delay_secs > self.shutdown.timeout_secs {
            return Err(ConfigError::InvalidValue {
                field: "shutdown.delay_secs".to_string(),
                message: format!(
                    "must not exceed shutdown.timeout_secs ({})",
                    self.shutdown.timeout_secs
                ),
            });
        }

        if !vrecon_common::is_valid_level(&self.logging.level) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!("must be one of: {:?}", vrecon_common::LOG_LEVELS),
            });
        }

        Ok(())
    }

    /// Reconciler settings derived from this configuration.
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            shutdown: ShutdownPolicy {
                delay: Duration::from_secs(self.shutdown.delay_secs),
                min_interval: Duration::from_secs(self.shutdown.min_interval_secs),
                timeout: Duration::from_secs(self.shutdown.timeout_secs),
            },
            domain: DomainStartPolicy {
                start: self.domain.start,
                autostart: self.domain.autostart,
            },
            network: NetworkPolicy {
                stop_before_undefine: self.network.stop_before_undefine,
            },
        }
    }
}

/// Hypervisor connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Client type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Libvirt,
            uri: "qemu:///system".to_string(),
        }
    }
}

/// Hypervisor client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Libvirt/QEMU
    #[default]
    Libvirt,
    /// In-memory mock for development
    Mock,
}

/// Shutdown timing, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Wait before the first state poll
    pub delay_secs: u64,
    /// Wait between later polls
    pub min_interval_secs: u64,
    /// Give up and force the domain off after this long
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            min_interval_secs: 5,
            timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    /// Boot the domain after defining it
    pub start: bool,
    /// Mark the domain to boot with the host
    pub autostart: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            start: true,
            autostart: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Stop an active network before undefining it
    pub stop_before_undefine: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit logs as JSON
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
