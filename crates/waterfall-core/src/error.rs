//! Errors raised by the wire codec and configuration layer.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that can occur while framing or parsing an on-wire message.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame length header ({declared}) does not match body length ({actual})")]
    Framing { declared: u32, actual: usize },

    #[error("message id mismatch: expected {expected}, computed {computed}")]
    Checksum { expected: String, computed: String },

    #[error("no compression method could decode this frame")]
    Compression,

    #[error("frame is missing a required packet (need at least {min}, found {found})")]
    Truncated { min: usize, found: usize },

    #[error("io error while framing a message: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that can occur loading or saving [`crate::config::NodeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}
