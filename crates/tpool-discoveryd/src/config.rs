// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Daemon configuration.
//!
//! A flat JSON file; every field has a default, so a minimal deployment
//! can start from `{}`.
//!
//! ```json
//! {
//!   "channel": "fabric:mem?endpoint=local",
//!   "announce_stream_id": 1001,
//!   "metadata_stream_id": 1300,
//!   "request_stream_id": 2000,
//!   "announce_period_ns": 1000000000,
//!   "max_entries": 1024,
//!   "max_results": 64
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use tpool::discovery::DiscoveryConfig;
use tpool::types::{
    ANNOUNCE_PERIOD_DEFAULT_NS, STREAM_ID_ANNOUNCE, STREAM_ID_DISCOVERY_REQUEST,
    STREAM_ID_METADATA,
};

/// Configuration load/validate failures.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "io error: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// On-disk daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Fabric channel the directory serves on.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// SHM-pool announce stream.
    #[serde(default = "default_announce_stream_id")]
    pub announce_stream_id: u32,

    /// Data-source announce / metadata stream.
    #[serde(default = "default_metadata_stream_id")]
    pub metadata_stream_id: u32,

    /// Discovery request stream.
    #[serde(default = "default_request_stream_id")]
    pub request_stream_id: u32,

    /// Producer announce cadence; entries expire after three periods.
    #[serde(default = "default_announce_period_ns")]
    pub announce_period_ns: u64,

    /// Entry table capacity.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Hard cap on results per query.
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

fn default_channel() -> String {
    "fabric:mem?endpoint=local".to_string()
}

fn default_announce_stream_id() -> u32 {
    STREAM_ID_ANNOUNCE
}

fn default_metadata_stream_id() -> u32 {
    STREAM_ID_METADATA
}

fn default_request_stream_id() -> u32 {
    STREAM_ID_DISCOVERY_REQUEST
}

fn default_announce_period_ns() -> u64 {
    ANNOUNCE_PERIOD_DEFAULT_NS
}

fn default_max_entries() -> usize {
    1024
}

fn default_max_results() -> u32 {
    64
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            announce_stream_id: default_announce_stream_id(),
            metadata_stream_id: default_metadata_stream_id(),
            request_stream_id: default_request_stream_id(),
            announce_period_ns: default_announce_period_ns(),
            max_entries: default_max_entries(),
            max_results: default_max_results(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file (used to seed deployments).
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::InvalidValue("channel cannot be empty".into()));
        }
        if self.announce_period_ns == 0 {
            return Err(ConfigError::InvalidValue(
                "announce_period_ns cannot be 0".into(),
            ));
        }
        if self.max_entries == 0 || self.max_results == 0 {
            return Err(ConfigError::InvalidValue(
                "max_entries and max_results cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

impl From<DaemonConfig> for DiscoveryConfig {
    fn from(config: DaemonConfig) -> Self {
        Self {
            channel: config.channel,
            announce_stream_id: config.announce_stream_id,
            metadata_stream_id: config.metadata_stream_id,
            request_stream_id: config.request_stream_id,
            announce_period_ns: config.announce_period_ns,
            max_entries: config.max_entries,
            max_results: config.max_results,
        }
    }
}

/// Load and convert in one step for `main`.
pub fn load(path: &Path) -> Result<DiscoveryConfig, ConfigError> {
    DaemonConfig::from_file(path).map(Into::into)
}
