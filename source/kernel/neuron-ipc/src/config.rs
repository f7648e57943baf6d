// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tunables for the IPC core, loadable from TOML
//! OWNERS: @kernel-team
//! PUBLIC API: IpcConfig, ConfigError
//! INVARIANTS: queue_max >= 1; max_message_size >= 64 KiB; handle table fits below ROOT_PORT

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::handle::HandleId;

/// Lower bound for [`IpcConfig::max_message_size`].
pub const MIN_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

/// IPC core configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpcConfig {
    /// Soft cap on the number of queued messages per endpoint.
    pub queue_max: usize,
    /// Largest data blob accepted on a single message.
    pub max_message_size: usize,
    /// Number of slots in each process' handle table.
    pub handle_table_size: usize,
    /// Bytes of live message buffers chargeable to a single sending process.
    pub process_message_quota: usize,
    /// Interval at which blocked threads re-check for interruption.
    pub wait_tick_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            queue_max: 256,
            max_message_size: MIN_MESSAGE_SIZE_LIMIT,
            handle_table_size: 512,
            process_message_quota: 16 * 1024 * 1024,
            wait_tick_ms: 10,
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// Location associated with the error.
        path: PathBuf,
        /// Underlying operating system error.
        source: std::io::Error,
    },
    /// TOML parsing failed.
    #[error("failed to parse ipc config {path}: {source}")]
    Parse {
        /// Location of the malformed file.
        path: PathBuf,
        /// Error returned by the TOML deserializer.
        source: toml::de::Error,
    },
    /// Values parsed but violate a constraint.
    #[error("invalid ipc config: {reason}")]
    Invalid {
        /// Human readable description of the violated constraint.
        reason: String,
    },
}

impl IpcConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, Path::new("<inline>"))
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants listed in the module header.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max == 0 {
            return Err(invalid("queue_max must be at least 1"));
        }
        if self.max_message_size < MIN_MESSAGE_SIZE_LIMIT {
            return Err(invalid(format!(
                "max_message_size must be at least {MIN_MESSAGE_SIZE_LIMIT}"
            )));
        }
        if self.max_message_size > u32::MAX as usize {
            return Err(invalid("max_message_size must fit the 32-bit size field"));
        }
        if self.handle_table_size == 0 || self.handle_table_size >= HandleId::ROOT_PORT.raw() as usize {
            return Err(invalid("handle_table_size out of range"));
        }
        if self.wait_tick_ms == 0 {
            return Err(invalid("wait_tick_ms must be non-zero"));
        }
        Ok(())
    }

    /// Tick as a [`Duration`].
    pub fn wait_tick(&self) -> Duration {
        Duration::from_millis(self.wait_tick_ms)
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { reason: reason.into() }
}
