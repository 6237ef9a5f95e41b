//! Master configuration.
//!
//! Loaded from an optional TOML file; every field has a default so an
//! empty file (or none at all) yields a runnable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{MOTOR_NODE_FIRST, NODE_ID_MAX};

/// Configuration-loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration of the master process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    /// Directory holding one motion table per node (`<nodeid>.mot`).
    pub tables_dir: PathBuf,
    /// Suffix appended to table names when running against the simulator.
    pub fake_table_suffix: String,
    /// Operator FIFO: telemetry out, streamed positions in.
    pub stream_pipe: PathBuf,
    /// FIFO used when running against the simulator.
    pub fake_stream_pipe: PathBuf,
    /// SYNC producer period in milliseconds.
    pub sync_period_ms: u64,
    /// Heartbeat producer period programmed into every drive, ms.
    pub heartbeat_ms: u16,
    /// Window the discovery phase waits for bootups, milliseconds.
    pub discover_timeout_ms: u64,
    /// Acceleration applied to every streamed free-move sample. The
    /// original controller fixed this at 100.
    pub stream_acceleration: u32,
    /// Node ids the simulator instantiates.
    pub fake_nodes: Vec<u8>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            tables_dir: PathBuf::from("tables"),
            fake_table_suffix: String::from(".fake"),
            stream_pipe: PathBuf::from("/tmp/alma_3d_spinitalia_pos_stream_pipe"),
            fake_stream_pipe: PathBuf::from("/tmp/fake_alma_3d_spinitalia_pos_stream_pipe"),
            sync_period_ms: 100,
            heartbeat_ms: 100,
            discover_timeout_ms: 3_000,
            stream_acceleration: 100,
            fake_nodes: (0..4).map(|i| MOTOR_NODE_FIRST + i).collect(),
        }
    }
}

impl MasterConfig {
    /// Load from a TOML file, applying defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_period_ms == 0 {
            return Err(ConfigError::Invalid("sync_period_ms must be > 0".into()));
        }
        if self.fake_nodes.iter().any(|&n| n == 0 || n > NODE_ID_MAX) {
            return Err(ConfigError::Invalid(
                "fake_nodes entries must be in 1..=127".into(),
            ));
        }
        Ok(())
    }

    /// Motion-table path for one node, honouring the simulator suffix.
    pub fn table_path(&self, node: u8, fake: bool) -> PathBuf {
        let name = if fake {
            format!("{node}.mot{}", self.fake_table_suffix)
        } else {
            format!("{node}.mot")
        };
        self.tables_dir.join(name)
    }

    /// Operator FIFO path for the selected backend.
    pub fn pipe_path(&self, fake: bool) -> &Path {
        if fake {
            &self.fake_stream_pipe
        } else {
            &self.stream_pipe
        }
    }
}
