use crate::domain::models::ConnectionState;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the registry, scanner and hub session layers.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("registry file not found at {0}")]
    RegistryMissing(PathBuf),

    #[error("no hubs found in registry {0}")]
    RegistryEmpty(PathBuf),

    #[error("registry {path} is corrupt: {reason}")]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("no hub with identity {0} in registry")]
    NotFound(String),

    #[error("connection to {identity} failed: {reason}")]
    ConnectionFailed { identity: String, reason: String },

    #[error("session for {0} is not running")]
    SessionClosed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("link to {0} dropped")]
    LinkDropped(String),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
