//! Errors returned by session operations.

use crate::device::registry::RegistryError;
use crate::device::transport::TransportError;
use crate::device::types::DeviceId;
use crate::session::state::SessionState;

/// Why a session could not run.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A session is already running. Nothing was changed.
    InvalidCommandState(SessionState),
    /// The request named no devices.
    NoDevices,
    /// The request named a device the registry does not know.
    UnknownDevice(DeviceId),
    /// Connecting or subscribing to a device failed. The session was aborted.
    ConnectionFailed {
        device: DeviceId,
        reason: String,
    },
    /// A device did not acknowledge a configuration command in time.
    ConfigurationTimeout(DeviceId),
    /// Discovery failed.
    Scan(RegistryError),
    /// The session task ended without reporting a result.
    Interrupted,
}

impl SessionError {
    pub(crate) fn connection(device: &DeviceId, err: impl std::fmt::Display) -> Self {
        SessionError::ConnectionFailed {
            device: device.clone(),
            reason: err.to_string(),
        }
    }

    /// Short machine-readable code, used by the HTTP driver.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidCommandState(_) => "INVALID_COMMAND_STATE",
            SessionError::NoDevices => "NO_DEVICES",
            SessionError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            SessionError::ConnectionFailed { .. } => "CONNECTION_FAILED",
            SessionError::ConfigurationTimeout(_) => "CONFIGURATION_TIMEOUT",
            SessionError::Scan(_) => "SCAN_FAILED",
            SessionError::Interrupted => "INTERRUPTED",
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::InvalidCommandState(state) => {
                write!(f, "cannot start a session while {state}")
            }
            SessionError::NoDevices => write!(f, "no devices requested"),
            SessionError::UnknownDevice(id) => write!(f, "no such device: {id}"),
            SessionError::ConnectionFailed { device, reason } => {
                write!(f, "connection to {device} failed: {reason}")
            }
            SessionError::ConfigurationTimeout(id) => {
                write!(f, "{id} did not acknowledge configuration")
            }
            SessionError::Scan(e) => write!(f, "{e}"),
            SessionError::Interrupted => write!(f, "session task ended unexpectedly"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => SessionError::UnknownDevice(id),
            other => SessionError::Scan(other),
        }
    }
}

/// Command failures during configuration broadcast, before translation.
#[derive(Debug)]
pub(crate) enum BroadcastFailure {
    Timeout(DeviceId),
    Transport(DeviceId, TransportError),
}

impl From<BroadcastFailure> for SessionError {
    fn from(f: BroadcastFailure) -> Self {
        match f {
            BroadcastFailure::Timeout(id) => SessionError::ConfigurationTimeout(id),
            BroadcastFailure::Transport(id, e) => SessionError::connection(&id, e),
        }
    }
}
