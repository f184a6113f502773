//! Error types for the orchestration layer.

use thiserror::Error;

use crate::types::{DeviceAddress, OperationKind};

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the underlying BLE driver.
///
/// The driver delivers these both as operation results and as asynchronous
/// adapter events. `fatal` is the driver's signal that the adapter is no
/// longer usable; everything else is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub message: String,
    pub fatal: bool,
}

impl DriverError {
    /// A recoverable driver error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// An error after which the adapter is no longer usable.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// Unified error type for all orchestration operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An operation needed an open adapter, but none is selected.
    #[error("no adapter selected")]
    NoAdapterSelected,

    /// An open was requested for a port the registry does not know about.
    #[error("no adapter found for port {port}")]
    AdapterNotFound { port: String },

    /// The driver reported a failure for an issued operation.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// An instance-bound operation was attempted on a device that has not
    /// completed a connection.
    #[error("device {address} is not connected")]
    NotConnected { address: DeviceAddress },

    /// An operation of the same kind is still pending.
    #[error("a {kind} operation is already in flight")]
    OperationInFlight { kind: OperationKind },
}
