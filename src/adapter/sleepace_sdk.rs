// Sleepace SDK binding contract
//
// The Sleepace BLE SDK owns scanning, the link, the session handshake and the
// binary configuration frame. This trait is the surface the adapter needs.

use crate::models::ServerProtocol;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transfer status reported by the SDK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepaceStatus {
    Succeed,
    ConnectFailed,
    ParameterError,
    Timeout,
    Failed,
    ResponseFailed,
    Unauthorized,
    HandshakeFailed,
    BluetoothOff,
    Disconnected,
    NotFound,
    Other(i32),
}

impl SleepaceStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => SleepaceStatus::Succeed,
            1 => SleepaceStatus::ConnectFailed,
            2 => SleepaceStatus::ParameterError,
            3 => SleepaceStatus::Timeout,
            4 => SleepaceStatus::Failed,
            5 => SleepaceStatus::ResponseFailed,
            6 => SleepaceStatus::Unauthorized,
            7 => SleepaceStatus::HandshakeFailed,
            8 => SleepaceStatus::BluetoothOff,
            9 => SleepaceStatus::Disconnected,
            10 => SleepaceStatus::NotFound,
            other => SleepaceStatus::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            SleepaceStatus::Succeed => 0,
            SleepaceStatus::ConnectFailed => 1,
            SleepaceStatus::ParameterError => 2,
            SleepaceStatus::Timeout => 3,
            SleepaceStatus::Failed => 4,
            SleepaceStatus::ResponseFailed => 5,
            SleepaceStatus::Unauthorized => 6,
            SleepaceStatus::HandshakeFailed => 7,
            SleepaceStatus::BluetoothOff => 8,
            SleepaceStatus::Disconnected => 9,
            SleepaceStatus::NotFound => 10,
            SleepaceStatus::Other(code) => *code,
        }
    }
}

impl fmt::Display for SleepaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Sleepace SDK status {status}")]
pub struct SleepaceFault {
    pub status: SleepaceStatus,
}

impl From<SleepaceStatus> for SleepaceFault {
    fn from(status: SleepaceStatus) -> Self {
        Self { status }
    }
}

/// A peripheral reported by the SDK scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SleepacePeripheral {
    pub peripheral_id: String,
    pub name: String,
    /// Sleepace device code, when present in the advertisement.
    pub device_code: Option<String>,
    pub mac_address: Option<String>,
    pub rssi: Option<i32>,
}

/// Contents of the binary configuration frame; the SDK does the encoding.
/// Unset groups are left unchanged on the device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SleepaceConfigFrame {
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub server_address: Option<String>,
    pub server_port: u16,
    pub server_protocol: Option<ServerProtocol>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SleepaceAck {
    pub status: SleepaceStatus,
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SleepaceWifiStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    pub mac_address: Option<String>,
    pub rssi: Option<i32>,
    pub server_address: Option<String>,
    pub server_port: Option<u16>,
    pub server_protocol: Option<ServerProtocol>,
    pub server_connected: bool,
    pub firmware_version: Option<String>,
}

#[async_trait]
pub trait SleepaceClient: Send + Sync {
    async fn bluetooth_enabled(&self) -> bool;

    /// Start the SDK scan. The SDK has no filtering; every peripheral it
    /// sees is reported, repeats included.
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<SleepacePeripheral>, SleepaceFault>;

    async fn stop_scan(&self);

    async fn connect(&self, peripheral: &SleepacePeripheral) -> Result<(), SleepaceFault>;

    /// Proprietary session handshake; must precede `send_config_frame`.
    async fn handshake(&self) -> Result<(), SleepaceFault>;

    async fn send_config_frame(&self, frame: &SleepaceConfigFrame) -> Result<(), SleepaceFault>;

    /// Wait for the device's reply to the last configuration frame. Cancel-safe.
    async fn await_ack(&self) -> Result<SleepaceAck, SleepaceFault>;

    async fn query_wifi_status(&self) -> Result<SleepaceWifiStatus, SleepaceFault>;

    /// Drop the link. Idempotent.
    async fn disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip_for_unknown() {
        assert_eq!(SleepaceStatus::from_code(42), SleepaceStatus::Other(42));
        assert_eq!(SleepaceStatus::from_code(3).code(), 3);
    }
}
