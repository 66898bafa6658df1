//! Error types for bluepanel-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceType;

/// Errors produced by configuration loading and coordinator operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    ConfigValidation(Vec<String>),

    /// No adapter is bound, so there is nothing to operate on.
    #[error("no bluetooth adapter available")]
    NoAdapter,

    /// An identical request is still waiting for the service.
    #[error("a request for {0} is already pending")]
    AlreadyPending(String),

    /// The user answered a prompt that is not outstanding.
    #[error("no pending {0} request")]
    NoPendingRequest(&'static str),

    #[error("no device selected")]
    NoSelection,

    #[error("no such device: {0}")]
    DeviceNotFound(String),

    #[error("no connection mode for {0} devices")]
    NoConnectionMode(DeviceType),
}

pub type Result<T> = std::result::Result<T, Error>;
