//! Server configuration
//!
//! Process-wide settings for the backend chain, loaded once at startup
//! and handed to the [`Chain`](crate::chain::Chain). Nothing here is
//! mutated after the chain is built.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};
use crate::extent::MAX_EXTENTS;
use crate::logging::LogConfig;

/// Largest single request the transport will pass down
pub const MAX_REQUEST_SIZE: u32 = 64 * 1024 * 1024;

/// Longest export name or description accepted from a backend
pub const MAX_STRING: usize = 4096;

/// Which dispatcher events are logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    /// Lifecycle and capability events
    pub controlpath: bool,
    /// Per-request events
    pub datapath: bool,
}

impl Default for DebugFlags {
    fn default() -> Self {
        Self {
            controlpath: true,
            datapath: true,
        }
    }
}

/// Backend chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Dispatcher debug switches
    pub debug: DebugFlags,
    /// Cap on entries stored by an extent ledger
    pub max_extents: usize,
    /// Chunk size for emulated cache and zero requests
    pub max_request_size: u32,
    /// Longest default export name or description kept
    pub max_string_len: usize,
    /// Logging settings
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::default(),
            max_extents: MAX_EXTENTS,
            max_request_size: MAX_REQUEST_SIZE,
            max_string_len: MAX_STRING,
            log: LogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the extent ledger cap
    pub fn with_max_extents(mut self, max: usize) -> Self {
        self.max_extents = max;
        self
    }

    /// Set the emulation chunk size
    pub fn with_max_request_size(mut self, size: u32) -> Self {
        self.max_request_size = size;
        self
    }

    /// Set the longest accepted export string
    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    /// Disable control-path debug events
    pub fn no_controlpath_debug(mut self) -> Self {
        self.debug.controlpath = false;
        self
    }

    /// Disable data-path debug events
    pub fn no_datapath_debug(mut self) -> Self {
        self.debug.datapath = false;
        self
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> BackendResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| BackendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> BackendResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `{prefix}_*` environment variable overrides
    pub fn apply_env_overrides(mut self, prefix: &str) -> BackendResult<Self> {
        if let Ok(val) = std::env::var(format!("{prefix}_DEBUG_CONTROLPATH")) {
            self.debug.controlpath = parse_bool(&val)
                .ok_or_else(|| invalid(prefix, "DEBUG_CONTROLPATH", &val))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_DEBUG_DATAPATH")) {
            self.debug.datapath =
                parse_bool(&val).ok_or_else(|| invalid(prefix, "DEBUG_DATAPATH", &val))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_EXTENTS")) {
            self.max_extents = val
                .parse()
                .map_err(|_| invalid(prefix, "MAX_EXTENTS", &val))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_MAX_REQUEST_SIZE")) {
            self.max_request_size = val
                .parse()
                .map_err(|_| invalid(prefix, "MAX_REQUEST_SIZE", &val))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            self.log.level = val.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the configuration for unusable values
    pub fn validate(&self) -> BackendResult<()> {
        if self.max_extents == 0 {
            return Err(BackendError::Config("max_extents must be non-zero".into()));
        }
        if self.max_request_size == 0 {
            return Err(BackendError::Config(
                "max_request_size must be non-zero".into(),
            ));
        }
        if self.max_string_len == 0 {
            return Err(BackendError::Config("max_string_len must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid(prefix: &str, key: &str, val: &str) -> BackendError {
    BackendError::Config(format!("invalid value for {prefix}_{key}: {val}"))
}
