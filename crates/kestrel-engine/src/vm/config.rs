//! Runtime configuration
//!
//! Sizes of the heap, native stack and call stack, plus the diagnostic
//! switches. The switches only feed logs; they never change what a
//! collection frees.

use super::defaults::{DEFAULT_CALL_STACK_CAPACITY, DEFAULT_HEAP_SIZE, DEFAULT_STACK_SIZE};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A size that cannot work
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// VM configuration
///
/// ```toml
/// heap_size = 1048576
/// log_deallocation = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Managed heap size in bytes; exhausting it is fatal
    pub heap_size: usize,

    /// Native stack size in bytes
    pub stack_size: usize,

    /// Maximum call depth
    pub call_stack_capacity: usize,

    /// Record every allocation address
    pub log_allocation: bool,

    /// Record every deallocation, per collection
    pub log_deallocation: bool,

    /// Trace every allocation
    pub print_allocation: bool,

    /// Trace every deallocation
    pub print_deallocation: bool,

    /// Trace every frame slot visited while collecting roots
    pub print_stack_frame: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            stack_size: DEFAULT_STACK_SIZE,
            call_stack_capacity: DEFAULT_CALL_STACK_CAPACITY,
            log_allocation: false,
            log_deallocation: false,
            print_allocation: false,
            print_deallocation: false,
            print_stack_frame: false,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Turn on both in-memory logs
    pub fn with_logging(mut self) -> Self {
        self.log_allocation = true;
        self.log_deallocation = true;
        self
    }

    /// Check that every size is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_size == 0 {
            return Err(ConfigError::Invalid("heap_size must be non-zero".to_string()));
        }
        if self.stack_size < 64 {
            return Err(ConfigError::Invalid(format!(
                "stack_size must be at least 64 bytes, got {}",
                self.stack_size
            )));
        }
        if self.call_stack_capacity == 0 {
            return Err(ConfigError::Invalid(
                "call_stack_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
