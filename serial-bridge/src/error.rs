use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

use crate::record::BridgeId;

/// Errors returned by the bridge supervisor.
#[derive(Error, Diagnostic, Debug)]
pub enum BridgeError {
    #[error("Serial device {} is not available: {reason}", .path.display())]
    #[diagnostic(help("Check that the adapter is connected and readable and writable by this user"))]
    DeviceNotFound { path: PathBuf, reason: String },

    #[error("TCP port {host}:{port} is already in use{holder}")]
    #[diagnostic(help("Stop the bridge holding the port or choose a different port"))]
    PortInUse {
        host: String,
        port: u16,
        holder: String,
    },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bridge start was cancelled")]
    Cancelled,

    #[error("Bridge {0} not found")]
    NotFound(BridgeId),

    #[error("Bridge {0} is already registered")]
    AlreadyRegistered(BridgeId),

    #[error("Failed to read profiles from {}: {reason}", .path.display())]
    InvalidProfiles { path: PathBuf, reason: String },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub(crate) fn device<S: ToString>(path: impl Into<PathBuf>, reason: S) -> Self {
        Self::DeviceNotFound {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn port_in_use(host: &str, port: u16, holder: impl Into<String>) -> Self {
        Self::PortInUse {
            host: host.to_string(),
            port,
            holder: holder.into(),
        }
    }
}

/// A specialized result type for bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
