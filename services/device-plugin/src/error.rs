//! Error types for the device plugin.

use std::path::PathBuf;

use thiserror::Error;
use tonic::Status;

/// Device plugin errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Virtual device id does not follow the `<physical>-<slot>` convention.
    #[error("malformed_id: {0}")]
    MalformedId(String),

    /// Allocate named a device that is not advertised.
    #[error("unknown_device: {0}")]
    UnknownDevice(String),

    /// Allocate named a device that has been marked unhealthy.
    #[error("unhealthy_device: {0}")]
    UnhealthyDevice(String),

    /// A container request carried no device ids.
    #[error("empty_request: container request names no devices")]
    EmptyRequest,

    /// The plugin socket path could not be cleaned up or bound.
    #[error("bind_failed: {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The freshly started server did not answer a request in time.
    #[error("startup_timeout: {}: {detail}", .path.display())]
    StartupTimeout { path: PathBuf, detail: String },

    /// The kubelet could not be reached or rejected the registration.
    #[error("registration_failed: {0}")]
    Registration(String),

    /// A unix socket dial failed or timed out.
    #[error("dial_failed: {}: {detail}", .path.display())]
    Dial { path: PathBuf, detail: String },

    /// Physical device enumeration is unavailable.
    #[error("discovery_failed: {0}")]
    Discovery(String),

    /// A lifecycle operation was called in the wrong state.
    #[error("invalid_state: {0}")]
    InvalidState(&'static str),
}

impl PluginError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PluginError::MalformedId(_) => "malformed_id",
            PluginError::UnknownDevice(_) => "unknown_device",
            PluginError::UnhealthyDevice(_) => "unhealthy_device",
            PluginError::EmptyRequest => "empty_request",
            PluginError::Bind { .. } => "bind_failed",
            PluginError::StartupTimeout { .. } => "startup_timeout",
            PluginError::Registration(_) => "registration_failed",
            PluginError::Dial { .. } => "dial_failed",
            PluginError::Discovery(_) => "discovery_failed",
            PluginError::InvalidState(_) => "invalid_state",
        }
    }
}

impl From<PluginError> for Status {
    fn from(err: PluginError) -> Self {
        let message = format!("invalid allocation request: {err}");
        match err {
            PluginError::MalformedId(_)
            | PluginError::UnknownDevice(_)
            | PluginError::EmptyRequest => Status::invalid_argument(message),
            PluginError::UnhealthyDevice(_) => Status::failed_precondition(message),
            other => Status::internal(other.to_string()),
        }
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
