// Shared error taxonomy
//
// Every failure that leaves an adapter or the orchestrator is a
// `ProvisionError`: a machine-readable `ErrorKind` plus a message that can be
// shown to the user as-is. Vendor-specific fault codes are mapped into this
// shape in `normalize`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Vendor-independent failure classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ConnectionTimeout,
    SecurityNegotiationFailed,
    DataTransmissionError,
    DeviceNotFound,
    BluetoothDisabled,
    InvalidParameter,
    /// Another operation is already in flight on the same adapter.
    Busy,
    /// The operation was cancelled by `disconnect` or a superseding connect.
    Cancelled,
    /// A vendor fault code with no mapping.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::SecurityNegotiationFailed => "security_negotiation_failed",
            ErrorKind::DataTransmissionError => "data_transmission_error",
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::BluetoothDisabled => "bluetooth_disabled",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::Busy => "busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Errors after which the link cannot be trusted and the adapter
    /// returns to `Idle`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::DeviceNotFound | ErrorKind::BluetoothDisabled | ErrorKind::ConnectionTimeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ProvisionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProvisionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameter, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceNotFound, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn bluetooth_disabled() -> Self {
        Self::new(
            ErrorKind::BluetoothDisabled,
            "Bluetooth is turned off. Enable Bluetooth and try again.",
        )
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_message_not_kind() {
        let err = ProvisionError::new(ErrorKind::DeviceNotFound, "Device RX-1 is out of range");
        assert_eq!(err.to_string(), "Device RX-1 is out of range");
        assert_eq!(err.kind.to_string(), "device_not_found");
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::BluetoothDisabled.is_fatal());
        assert!(ErrorKind::DeviceNotFound.is_fatal());
        assert!(!ErrorKind::DataTransmissionError.is_fatal());
        assert!(!ErrorKind::SecurityNegotiationFailed.is_fatal());
        assert!(!ErrorKind::Cancelled.is_fatal());
    }
}
