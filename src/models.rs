// Device and configuration model
//
// Vendor-agnostic description of a discovered/configured device plus the
// request/report types used by `configure`.

use crate::error::{ProvisionError, ProvisionResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Reserved signal value meaning "not read yet".
pub const SIGNAL_UNAVAILABLE: i32 = -255;

/// Default backend endpoint used when storage has nothing saved.
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_SERVER_PROTOCOL: ServerProtocol = ServerProtocol::Tcp;

const MAX_SSID_BYTES: usize = 32;
const MAX_PASSWORD_BYTES: usize = 64;

// ============================================================================
// Identity types
// ============================================================================

/// Device manufacturers known to the provisioning core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vendor {
    /// Radar sensors speaking the BluFi protocol.
    RadarQl,
    /// Sleepace sleep-monitoring boards.
    SleepBoardHs,
    /// Generic ESP32 boards with the stock BluFi firmware.
    EspBle,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::RadarQl => f.write_str("radar"),
            Vendor::SleepBoardHs => f.write_str("sleepace"),
            Vendor::EspBle => f.write_str("esp"),
        }
    }
}

/// Signal strength in dBm, or the `SIGNAL_UNAVAILABLE` sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalStrength(i32);

impl SignalStrength {
    pub const UNAVAILABLE: SignalStrength = SignalStrength(SIGNAL_UNAVAILABLE);

    /// Build from a platform reading. A missing reading, or one that collides
    /// with the sentinel, becomes `UNAVAILABLE`.
    pub fn from_reading(reading: Option<i32>) -> Self {
        match reading {
            Some(v) if v > SIGNAL_UNAVAILABLE => SignalStrength(v),
            _ => Self::UNAVAILABLE,
        }
    }

    pub fn dbm(&self) -> Option<i32> {
        if self.is_available() {
            Some(self.0)
        } else {
            None
        }
    }

    pub fn is_available(&self) -> bool {
        self.0 != SIGNAL_UNAVAILABLE
    }

    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl Default for SignalStrength {
    fn default() -> Self {
        Self::UNAVAILABLE
    }
}

// ============================================================================
// State blocks
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiMode {
    #[serde(rename = "STA")]
    Station,
    #[serde(rename = "AP")]
    AccessPoint,
    #[serde(rename = "STASOFTAP")]
    StationAp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerProtocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl ServerProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerProtocol::Tcp => "TCP",
            ServerProtocol::Udp => "UDP",
        }
    }

    /// Case-insensitive parse of "TCP"/"UDP".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(ServerProtocol::Tcp),
            "UDP" => Some(ServerProtocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiState {
    pub ssid: Option<String>,
    pub connected: bool,
    pub mode: Option<WifiMode>,
    pub signal: SignalStrength,
    pub mac_address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<ServerProtocol>,
    pub connected: bool,
}

// ============================================================================
// Device record
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    vendor: Vendor,
    device_id: String,
    pub name: String,
    /// Bluetooth MAC, when the platform exposes it.
    pub mac_address: Option<String>,
    /// Platform peripheral UUID (CoreBluetooth-style identifiers).
    pub uuid: Option<String>,
    pub rssi: SignalStrength,
    pub version: Option<String>,
    pub uid: Option<String>,
    pub device_type: Option<String>,
    pub wifi: Option<WifiState>,
    pub server: Option<ServerState>,
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Record created on discovery: identity and signal only.
    pub fn discovered(
        vendor: Vendor,
        device_id: impl Into<String>,
        name: impl Into<String>,
        rssi: SignalStrength,
    ) -> Self {
        Self {
            vendor,
            device_id: device_id.into(),
            name: name.into(),
            mac_address: None,
            uuid: None,
            rssi,
            version: None,
            uid: None,
            device_type: None,
            wifi: None,
            server: None,
            last_update: None,
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Copy of this record with both state blocks replaced by a fresh read.
    /// Identity is carried over untouched.
    pub fn refreshed(&self, wifi: Option<WifiState>, server: Option<ServerState>) -> Self {
        Self {
            wifi,
            server,
            last_update: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn wifi_ssid(&self) -> Option<&str> {
        self.wifi.as_ref().and_then(|w| w.ssid.as_deref())
    }

    pub fn wifi_connected(&self) -> bool {
        self.wifi.as_ref().map(|w| w.connected).unwrap_or(false)
    }

    pub fn wifi_signal(&self) -> SignalStrength {
        self.wifi.as_ref().map(|w| w.signal).unwrap_or_default()
    }
}

// ============================================================================
// Configuration request
// ============================================================================

/// Caller-supplied configuration. At least one of the WiFi or server groups
/// must be present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureRequest {
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub server_address: Option<String>,
    /// Signed so that out-of-range input from forms is rejected, not wrapped.
    pub server_port: i32,
    pub server_protocol: Option<ServerProtocol>,
}

impl ConfigureRequest {
    pub fn wifi(ssid: impl Into<String>, password: Option<&str>) -> Self {
        Self {
            wifi_ssid: Some(ssid.into()),
            wifi_password: password.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn server(address: impl Into<String>, port: i32, protocol: Option<ServerProtocol>) -> Self {
        Self {
            server_address: Some(address.into()),
            server_port: port,
            server_protocol: protocol,
            ..Self::default()
        }
    }

    pub fn with_server(
        mut self,
        address: impl Into<String>,
        port: i32,
        protocol: Option<ServerProtocol>,
    ) -> Self {
        self.server_address = Some(address.into());
        self.server_port = port;
        self.server_protocol = protocol;
        self
    }

    /// Check the request before any wire traffic happens.
    pub fn validate(&self) -> ProvisionResult<ValidatedConfig> {
        let wifi = match &self.wifi_ssid {
            Some(ssid) => {
                if ssid.trim().is_empty() {
                    return Err(ProvisionError::invalid("WiFi SSID must not be empty"));
                }
                if ssid.len() > MAX_SSID_BYTES {
                    return Err(ProvisionError::invalid(format!(
                        "WiFi SSID is longer than {MAX_SSID_BYTES} bytes"
                    )));
                }
                let password = self.wifi_password.clone().filter(|p| !p.is_empty());
                if password.as_ref().is_some_and(|p| p.len() > MAX_PASSWORD_BYTES) {
                    return Err(ProvisionError::invalid(format!(
                        "WiFi password is longer than {MAX_PASSWORD_BYTES} bytes"
                    )));
                }
                Some(WifiCredentials {
                    ssid: ssid.clone(),
                    password,
                })
            }
            None => {
                if self.wifi_password.as_ref().is_some_and(|p| !p.is_empty()) {
                    return Err(ProvisionError::invalid("WiFi password given without an SSID"));
                }
                None
            }
        };

        let server = match &self.server_address {
            Some(address) => {
                if address.trim().is_empty() {
                    return Err(ProvisionError::invalid("Server address must not be empty"));
                }
                let port = u16::try_from(self.server_port)
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| {
                        ProvisionError::invalid(format!(
                            "Server port {} is outside 1-65535",
                            self.server_port
                        ))
                    })?;
                Some(ServerEndpoint {
                    address: address.trim().to_string(),
                    port,
                    protocol: self.server_protocol.unwrap_or(DEFAULT_SERVER_PROTOCOL),
                })
            }
            None => {
                if self.server_port != 0 || self.server_protocol.is_some() {
                    return Err(ProvisionError::invalid(
                        "Server port or protocol given without an address",
                    ));
                }
                None
            }
        };

        if wifi.is_none() && server.is_none() {
            return Err(ProvisionError::invalid(
                "Nothing to configure: provide WiFi credentials, a server address, or both",
            ));
        }

        Ok(ValidatedConfig { wifi, server })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
    pub protocol: ServerProtocol,
}

/// A request that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub wifi: Option<WifiCredentials>,
    pub server: Option<ServerEndpoint>,
}

// ============================================================================
// Configuration report
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub success: bool,
    pub status_code: i32,
    pub message: String,
}

impl StepOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            status_code: 0,
            message: message.into(),
        }
    }
}

/// Aggregate result of a `configure` call. WiFi and server settings are two
/// independent steps; a failed step does not roll back the other.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureReport {
    pub device_id: String,
    pub success: bool,
    pub status_code: i32,
    pub message: String,
    pub wifi: Option<StepOutcome>,
    pub server: Option<StepOutcome>,
}

impl ConfigureReport {
    pub fn from_steps(device_id: &str, wifi: Option<StepOutcome>, server: Option<StepOutcome>) -> Self {
        let failed = [wifi.as_ref(), server.as_ref()]
            .into_iter()
            .flatten()
            .find(|s| !s.success);
        let (success, status_code, message) = match failed {
            Some(step) => (false, step.status_code, step.message.clone()),
            None => {
                let applied: Vec<&str> = [
                    wifi.as_ref().map(|_| "WiFi"),
                    server.as_ref().map(|_| "server"),
                ]
                .into_iter()
                .flatten()
                .collect();
                (true, 0, format!("{} configuration applied", applied.join(" and ")))
            }
        };
        Self {
            device_id: device_id.to_string(),
            success,
            status_code,
            message,
            wifi,
            server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_signal_sentinel() {
        assert!(!SignalStrength::from_reading(None).is_available());
        assert_eq!(SignalStrength::from_reading(Some(-255)), SignalStrength::UNAVAILABLE);
        assert_eq!(SignalStrength::from_reading(Some(-61)).dbm(), Some(-61));
        assert_eq!(SignalStrength::default().raw(), SIGNAL_UNAVAILABLE);
    }

    #[test]
    fn test_discovered_record_has_no_state_blocks() {
        let rec = DeviceRecord::discovered(Vendor::RadarQl, "AA:BB", "RX-1", SignalStrength::from_reading(Some(-40)));
        assert_eq!(rec.vendor(), Vendor::RadarQl);
        assert_eq!(rec.device_id(), "AA:BB");
        assert!(rec.wifi.is_none());
        assert!(rec.server.is_none());
        assert!(!rec.wifi_signal().is_available());
    }

    #[test]
    fn test_refreshed_replaces_blocks_wholesale() {
        let mut rec = DeviceRecord::discovered(Vendor::SleepBoardHs, "p1", "Z4", SignalStrength::UNAVAILABLE);
        rec.wifi = Some(WifiState {
            ssid: Some("Old".into()),
            connected: true,
            mode: Some(WifiMode::Station),
            signal: SignalStrength::from_reading(Some(-50)),
            mac_address: Some("11:22".into()),
        });
        rec.server = Some(ServerState {
            address: Some("10.0.0.1".into()),
            port: Some(9000),
            protocol: Some(ServerProtocol::Udp),
            connected: true,
        });

        let fresh = rec.refreshed(
            Some(WifiState {
                ssid: Some("New".into()),
                ..WifiState::default()
            }),
            None,
        );
        let wifi = fresh.wifi.as_ref().unwrap();
        assert_eq!(wifi.ssid.as_deref(), Some("New"));
        // Nothing carried over from the old block
        assert!(wifi.mac_address.is_none());
        assert!(!wifi.signal.is_available());
        assert!(fresh.server.is_none());
        assert_eq!(fresh.device_id(), "p1");
        assert!(fresh.last_update.is_some());
    }

    #[test]
    fn test_validate_empty_request() {
        let err = ConfigureRequest::default().validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let blank_ssid = ConfigureRequest::wifi("  ", Some("secret123"));
        assert_eq!(blank_ssid.validate().unwrap_err().kind, ErrorKind::InvalidParameter);

        let negative_port = ConfigureRequest::server("example.com", -1, None);
        assert_eq!(negative_port.validate().unwrap_err().kind, ErrorKind::InvalidParameter);

        let huge_port = ConfigureRequest::server("example.com", 70000, None);
        assert!(huge_port.validate().is_err());

        let orphan_password = ConfigureRequest {
            wifi_password: Some("secret123".into()),
            ..ConfigureRequest::default()
        };
        assert!(orphan_password.validate().is_err());
    }

    #[test]
    fn test_validate_both_groups() {
        let req = ConfigureRequest::wifi("Home", Some("hunter22"))
            .with_server("iot.example.com", 1883, Some(ServerProtocol::Udp));
        let cfg = req.validate().unwrap();
        assert_eq!(cfg.wifi.unwrap().ssid, "Home");
        let server = cfg.server.unwrap();
        assert_eq!(server.port, 1883);
        assert_eq!(server.protocol, ServerProtocol::Udp);
    }

    #[test]
    fn test_validate_defaults_protocol_and_open_network() {
        let cfg = ConfigureRequest::wifi("Cafe", Some("")).validate().unwrap();
        assert!(cfg.wifi.unwrap().password.is_none());

        let cfg = ConfigureRequest::server("10.0.0.2", 8080, None).validate().unwrap();
        assert_eq!(cfg.server.unwrap().protocol, ServerProtocol::Tcp);
    }

    #[test]
    fn test_report_aggregates_failure() {
        let report = ConfigureReport::from_steps(
            "dev",
            Some(StepOutcome::ok("WiFi credentials accepted")),
            Some(StepOutcome {
                success: false,
                status_code: -3002,
                message: "Server rejected".into(),
            }),
        );
        assert!(!report.success);
        assert_eq!(report.status_code, -3002);

        let report = ConfigureReport::from_steps("dev", Some(StepOutcome::ok("ok")), None);
        assert!(report.success);
        assert_eq!(report.message, "WiFi configuration applied");
    }
}
