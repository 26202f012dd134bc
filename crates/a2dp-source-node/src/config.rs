//! Bootstrap configuration: the handful of dict keys the host passes when
//! constructing the node, plus CLI overrides for the demo binary.

use serde::Deserialize;

use crate::error::{NodeError, Result};

/// Mirrors the subset of the host's construction-time property dict this
/// node actually reads (`clock.quantum-limit`, `api.bluez5.transport`,
/// `bluez5.a2dp-source-role`, `api.bluez5.a2dp-duplex`).
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default = "default_quantum_limit_min")]
    pub quantum_limit_min: u32,
    #[serde(default = "default_quantum_limit_max")]
    pub quantum_limit_max: u32,
    /// `true` selects `is_duplex`/sink-role decoding of the bidirectional
    /// stream instead of the usual source role.
    #[serde(default)]
    pub duplex: bool,
    #[serde(default = "default_clock_name")]
    pub clock_name: String,
}

fn default_quantum_limit_min() -> u32 {
    256
}

fn default_quantum_limit_max() -> u32 {
    8192
}

fn default_clock_name() -> String {
    "clock.system.monotonic".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        TomlConfig {
            quantum_limit_min: default_quantum_limit_min(),
            quantum_limit_max: default_quantum_limit_max(),
            duplex: false,
            clock_name: default_clock_name(),
        }
    }
}

/// Resolved construction-time configuration for a node instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub quantum_limit_min: u32,
    pub quantum_limit_max: u32,
    pub duplex: bool,
    pub clock_name: String,
}

impl Config {
    /// Load from a TOML file on disk, falling back to built-in defaults for
    /// any field it doesn't set.
    pub async fn load(path: &str) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        let toml_config: TomlConfig = toml::from_str(&contents)
            .map_err(|e| NodeError::InvalidArg(format!("invalid config: {e}")))?;
        Ok(Config::from(toml_config))
    }

    /// Built-in defaults, for callers (tests, the demo binary without a
    /// `--config`) that don't read from disk.
    pub fn defaults() -> Self {
        Config::from(TomlConfig::default())
    }
}

impl From<TomlConfig> for Config {
    fn from(toml_config: TomlConfig) -> Self {
        Config {
            quantum_limit_min: toml_config.quantum_limit_min,
            quantum_limit_max: toml_config.quantum_limit_max,
            duplex: toml_config.duplex,
            clock_name: toml_config.clock_name,
        }
    }
}
