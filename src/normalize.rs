// Error normalizer
//
// Maps each vendor's native fault surface (BluFi status codes, Sleepace SDK
// transfer statuses, btleplug errors) into `ProvisionError`.

use crate::adapter::blufi::{self, BlufiFault};
use crate::adapter::sleepace_sdk::{SleepaceFault, SleepaceStatus};
use crate::error::{ErrorKind, ProvisionError};

/// Classify a BluFi status code.
pub fn blufi_kind(code: i32) -> ErrorKind {
    match code {
        blufi::CODE_NEG_POST_FAILED
        | blufi::CODE_NEG_ERR_DEV_KEY
        | blufi::CODE_NEG_ERR_SECURITY
        | blufi::CODE_NEG_ERR_SET_SECURITY => ErrorKind::SecurityNegotiationFailed,
        blufi::CODE_INVALID_NOTIFICATION
        | blufi::CODE_WRITE_DATA_FAILED
        | blufi::CODE_INVALID_DATA
        | blufi::CODE_GATT_WRITE_TIMEOUT
        | blufi::CODE_CONF_ERR_SET_OPMODE
        | blufi::CODE_CONF_ERR_POST_STA
        | blufi::CODE_CONF_ERR_POST_SOFTAP => ErrorKind::DataTransmissionError,
        blufi::CODE_CONF_INVALID_OPMODE => ErrorKind::InvalidParameter,
        blufi::CODE_CONNECT_FAILED => ErrorKind::ConnectionTimeout,
        blufi::CODE_DISCONNECTED | blufi::CODE_PERIPHERAL_NOT_FOUND => ErrorKind::DeviceNotFound,
        blufi::CODE_BLUETOOTH_OFF => ErrorKind::BluetoothDisabled,
        _ => ErrorKind::Unknown,
    }
}

fn blufi_message(kind: ErrorKind, code: i32) -> String {
    match kind {
        ErrorKind::SecurityNegotiationFailed => {
            format!("Security negotiation with the radar failed (code {code})")
        }
        ErrorKind::DataTransmissionError => {
            format!("Sending data to the radar failed (code {code})")
        }
        ErrorKind::InvalidParameter => format!("The radar rejected the WiFi mode (code {code})"),
        ErrorKind::ConnectionTimeout => format!("Could not connect to the radar (code {code})"),
        ErrorKind::DeviceNotFound => {
            format!("The radar is out of range or disconnected (code {code})")
        }
        ErrorKind::BluetoothDisabled => "Bluetooth is turned off".to_string(),
        _ => format!("Radar reported an unexpected error (code {code})"),
    }
}

impl From<BlufiFault> for ProvisionError {
    fn from(fault: BlufiFault) -> Self {
        let kind = blufi_kind(fault.code);
        ProvisionError::new(kind, blufi_message(kind, fault.code))
    }
}

/// Classify a Sleepace SDK status.
pub fn sleepace_kind(status: SleepaceStatus) -> ErrorKind {
    match status {
        SleepaceStatus::ConnectFailed => ErrorKind::ConnectionTimeout,
        SleepaceStatus::ParameterError => ErrorKind::InvalidParameter,
        SleepaceStatus::Unauthorized | SleepaceStatus::HandshakeFailed => {
            ErrorKind::SecurityNegotiationFailed
        }
        SleepaceStatus::Timeout | SleepaceStatus::Failed | SleepaceStatus::ResponseFailed => {
            ErrorKind::DataTransmissionError
        }
        SleepaceStatus::BluetoothOff => ErrorKind::BluetoothDisabled,
        SleepaceStatus::Disconnected | SleepaceStatus::NotFound => ErrorKind::DeviceNotFound,
        SleepaceStatus::Succeed | SleepaceStatus::Other(_) => ErrorKind::Unknown,
    }
}

impl From<SleepaceFault> for ProvisionError {
    fn from(fault: SleepaceFault) -> Self {
        let kind = sleepace_kind(fault.status);
        let code = fault.status.code();
        let message = match kind {
            ErrorKind::ConnectionTimeout => format!("Could not connect to the sleep board (status {code})"),
            ErrorKind::InvalidParameter => format!("The sleep board rejected the settings (status {code})"),
            ErrorKind::SecurityNegotiationFailed => {
                format!("Session handshake with the sleep board failed (status {code})")
            }
            ErrorKind::DataTransmissionError => {
                format!("Data exchange with the sleep board failed (status {code})")
            }
            ErrorKind::BluetoothDisabled => "Bluetooth is turned off".to_string(),
            ErrorKind::DeviceNotFound => {
                format!("The sleep board is out of range or disconnected (status {code})")
            }
            _ => format!("Sleep board reported an unexpected status ({code})"),
        };
        ProvisionError::new(kind, message)
    }
}

impl From<btleplug::Error> for ProvisionError {
    fn from(err: btleplug::Error) -> Self {
        use btleplug::Error as E;
        let kind = match &err {
            E::PermissionDenied => ErrorKind::BluetoothDisabled,
            E::DeviceNotFound | E::NotConnected => ErrorKind::DeviceNotFound,
            E::TimedOut(_) => ErrorKind::ConnectionTimeout,
            E::UnexpectedCallback | E::UnexpectedCharacteristic | E::NoSuchCharacteristic => {
                ErrorKind::DataTransmissionError
            }
            _ => ErrorKind::Unknown,
        };
        ProvisionError::new(kind, format!("Bluetooth error: {err}"))
    }
}
