// Simulated bench
//
// In-memory stand-ins for the platform central and both vendor SDKs. Each
// one keeps a small model of the devices behind it and can be told to
// misbehave (stay silent, hang, reject) so failure paths can be exercised
// without hardware. The CLI `bench` command runs on top of these too.

use crate::adapter::blufi::{self, BlufiClient, BlufiEvent, BlufiFault, BlufiOpMode, BlufiStationParams, BlufiStatus};
use crate::adapter::sleepace_sdk::{
    SleepaceAck, SleepaceClient, SleepaceConfigFrame, SleepaceFault, SleepacePeripheral,
    SleepaceStatus, SleepaceWifiStatus,
};
use crate::ble_common::{Advertisement, BleCentral};
use crate::error::ProvisionResult;
use crate::models::{ServerEndpoint, ServerProtocol, DEFAULT_SERVER_PROTOCOL, SIGNAL_UNAVAILABLE};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};

/// How a simulated device answers a configuration write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimAck {
    #[default]
    Normal,
    /// Never answer.
    Silent,
    /// Answer with this vendor status code.
    Reject(i32),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Central
// ============================================================================

#[derive(Default)]
struct CentralSim {
    powered: bool,
    devices: Vec<Advertisement>,
    tx: Option<mpsc::UnboundedSender<Advertisement>>,
}

pub struct SimCentral {
    state: Mutex<CentralSim>,
}

impl Default for SimCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCentral {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CentralSim {
                powered: true,
                ..CentralSim::default()
            }),
        }
    }

    /// Add (or refresh) an advertising peripheral. Repeats re-emit while
    /// discovery is running.
    pub fn advertise(&self, peripheral_id: &str, name: Option<&str>, rssi: i16) {
        self.advertise_full(Advertisement {
            peripheral_id: peripheral_id.to_string(),
            local_name: name.map(str::to_string),
            address: None,
            services: Vec::new(),
            rssi: Some(rssi),
        });
    }

    pub fn advertise_full(&self, adv: Advertisement) {
        let mut s = lock(&self.state);
        s.devices.retain(|d| d.peripheral_id != adv.peripheral_id);
        s.devices.push(adv.clone());
        if let Some(tx) = &s.tx {
            let _ = tx.send(adv);
        }
    }

    /// The peripheral goes out of range.
    pub fn vanish(&self, peripheral_id: &str) {
        lock(&self.state).devices.retain(|d| d.peripheral_id != peripheral_id);
    }

    pub fn set_powered(&self, powered: bool) {
        lock(&self.state).powered = powered;
    }

    pub fn is_discovering(&self) -> bool {
        lock(&self.state).tx.is_some()
    }
}

#[async_trait]
impl BleCentral for SimCentral {
    async fn radio_powered(&self) -> ProvisionResult<bool> {
        Ok(lock(&self.state).powered)
    }

    async fn start_discovery(&self) -> ProvisionResult<mpsc::UnboundedReceiver<Advertisement>> {
        let mut s = lock(&self.state);
        let (tx, rx) = mpsc::unbounded_channel();
        for adv in &s.devices {
            let _ = tx.send(adv.clone());
        }
        s.tx = Some(tx);
        Ok(rx)
    }

    async fn stop_discovery(&self) -> ProvisionResult<()> {
        lock(&self.state).tx = None;
        Ok(())
    }

    async fn is_known(&self, peripheral_id: &str) -> ProvisionResult<bool> {
        let s = lock(&self.state);
        Ok(s.powered && s.devices.iter().any(|d| d.peripheral_id == peripheral_id))
    }
}

// ============================================================================
// BluFi client
// ============================================================================

#[derive(Clone, Debug)]
struct RadarModel {
    version: String,
    mac: String,
    op_mode: BlufiOpMode,
    sta_ssid: Option<String>,
    sta_connected: bool,
    wifi_rssi: i32,
    server: Option<ServerEndpoint>,
}

#[derive(Default)]
struct BlufiSim {
    radars: HashMap<String, RadarModel>,
    open: Option<String>,
    negotiated: bool,
    events: VecDeque<BlufiEvent>,
    ack: SimAck,
    open_hangs: bool,
    negotiation_hangs: bool,
    associate_on_configure: bool,
    status_drops: usize,
    wire_writes: usize,
    discarded: usize,
}

pub struct SimBlufiClient {
    state: Mutex<BlufiSim>,
    notify: Notify,
}

impl Default for SimBlufiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBlufiClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BlufiSim {
                associate_on_configure: true,
                ..BlufiSim::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn add_radar(&self, peripheral_id: &str, version: &str, mac: &str) {
        lock(&self.state).radars.insert(
            peripheral_id.to_string(),
            RadarModel {
                version: version.to_string(),
                mac: mac.to_string(),
                op_mode: BlufiOpMode::Null,
                sta_ssid: None,
                sta_connected: false,
                wifi_rssi: -58,
                server: None,
            },
        );
    }

    pub fn set_ack(&self, ack: SimAck) {
        lock(&self.state).ack = ack;
    }

    pub fn set_open_hangs(&self, hangs: bool) {
        lock(&self.state).open_hangs = hangs;
    }

    pub fn set_negotiation_hangs(&self, hangs: bool) {
        lock(&self.state).negotiation_hangs = hangs;
    }

    /// Whether the radar joins the network it was given.
    pub fn set_associate_on_configure(&self, associate: bool) {
        lock(&self.state).associate_on_configure = associate;
    }

    /// Ignore the next `n` device status requests.
    pub fn drop_status_requests(&self, n: usize) {
        lock(&self.state).status_drops = n;
    }

    /// Writes that reached a device (negotiation, configure, custom data).
    pub fn wire_writes(&self) -> usize {
        lock(&self.state).wire_writes
    }

    /// Queue a `PostConfigureParams` notification as if an acknowledgement
    /// for an earlier frame arrived late.
    pub fn deliver_late_ack(&self, status: i32) {
        self.push(BlufiEvent::PostConfigureParams { status });
    }

    /// Notifications dropped by `discard_pending` so far.
    pub fn discarded_events(&self) -> usize {
        lock(&self.state).discarded
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open.is_some()
    }

    fn push(&self, event: BlufiEvent) {
        lock(&self.state).events.push_back(event);
        self.notify.notify_one();
    }

    fn open_radar(&self) -> Result<(String, RadarModel), BlufiFault> {
        let s = lock(&self.state);
        let id = s
            .open
            .clone()
            .ok_or_else(|| BlufiFault::new(blufi::CODE_DISCONNECTED, "link closed"))?;
        let radar = s
            .radars
            .get(&id)
            .cloned()
            .ok_or_else(|| BlufiFault::new(blufi::CODE_DISCONNECTED, "link closed"))?;
        Ok((id, radar))
    }

    fn custom_reply(&self, data: &[u8]) -> Result<Option<serde_json::Value>, BlufiFault> {
        let request: serde_json::Value = serde_json::from_slice(data)
            .map_err(|_| BlufiFault::new(blufi::CODE_INVALID_DATA, "payload is not JSON"))?;
        let mut s = lock(&self.state);
        let ack = s.ack;
        let id = s
            .open
            .clone()
            .ok_or_else(|| BlufiFault::new(blufi::CODE_DISCONNECTED, "link closed"))?;
        let radar = s
            .radars
            .get_mut(&id)
            .ok_or_else(|| BlufiFault::new(blufi::CODE_DISCONNECTED, "link closed"))?;

        let reply = match request["cmd"].as_str() {
            Some("set_server") => match ack {
                SimAck::Silent => None,
                SimAck::Reject(code) => Some(json!({ "code": code, "msg": "server rejected" })),
                SimAck::Normal => {
                    let protocol = request["protocol"]
                        .as_str()
                        .and_then(ServerProtocol::parse)
                        .unwrap_or(DEFAULT_SERVER_PROTOCOL);
                    radar.server = Some(ServerEndpoint {
                        address: request["address"].as_str().unwrap_or_default().to_string(),
                        port: request["port"].as_u64().and_then(|p| u16::try_from(p).ok()).unwrap_or(0),
                        protocol,
                    });
                    Some(json!({ "code": 0 }))
                }
            },
            Some("get_status") => {
                let server = radar.server.as_ref().map(|e| {
                    json!({
                        "address": e.address,
                        "port": e.port,
                        "protocol": e.protocol.as_str(),
                        "connected": radar.sta_connected,
                    })
                });
                let rssi = if radar.sta_connected {
                    radar.wifi_rssi
                } else {
                    SIGNAL_UNAVAILABLE
                };
                Some(json!({
                    "code": 0,
                    "server": server,
                    "wifi_rssi": rssi,
                    "mac": radar.mac,
                }))
            }
            _ => Some(json!({ "code": -1, "msg": "unknown command" })),
        };
        Ok(reply)
    }
}

#[async_trait]
impl BlufiClient for SimBlufiClient {
    async fn open(&self, peripheral_id: &str) -> Result<(), BlufiFault> {
        let hangs = {
            let mut s = lock(&self.state);
            if !s.radars.contains_key(peripheral_id) {
                return Err(BlufiFault::new(blufi::CODE_PERIPHERAL_NOT_FOUND, "no such peripheral"));
            }
            if !s.open_hangs {
                s.open = Some(peripheral_id.to_string());
                s.negotiated = false;
                s.events.clear();
            }
            s.open_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn negotiate_security(&self) -> Result<(), BlufiFault> {
        self.open_radar()?;
        let hangs = {
            let mut s = lock(&self.state);
            s.wire_writes += 1;
            if !s.negotiation_hangs {
                s.negotiated = true;
            }
            s.negotiation_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn post_configure(&self, params: &BlufiStationParams) -> Result<(), BlufiFault> {
        let (id, _) = self.open_radar()?;
        let reply = {
            let mut s = lock(&self.state);
            if !s.negotiated {
                return Err(BlufiFault::new(blufi::CODE_NEG_ERR_SECURITY, "not negotiated"));
            }
            s.wire_writes += 1;
            let associate = s.associate_on_configure;
            let ack = s.ack;
            match ack {
                SimAck::Silent => None,
                SimAck::Reject(code) => Some(code),
                SimAck::Normal => {
                    if let Some(radar) = s.radars.get_mut(&id) {
                        radar.op_mode = params.op_mode;
                        radar.sta_ssid = Some(params.sta_ssid.clone());
                        radar.sta_connected = associate;
                    }
                    Some(blufi::CODE_SUCCESS)
                }
            }
        };
        if let Some(status) = reply {
            self.push(BlufiEvent::PostConfigureParams { status });
        }
        Ok(())
    }

    async fn post_custom_data(&self, data: &[u8]) -> Result<(), BlufiFault> {
        self.open_radar()?;
        lock(&self.state).wire_writes += 1;
        if let Some(reply) = self.custom_reply(data)? {
            self.push(BlufiEvent::CustomData(reply.to_string().into_bytes()));
        }
        Ok(())
    }

    async fn request_device_status(&self) -> Result<(), BlufiFault> {
        let (_, radar) = self.open_radar()?;
        let dropped = {
            let mut s = lock(&self.state);
            if s.status_drops > 0 {
                s.status_drops -= 1;
                true
            } else {
                false
            }
        };
        if !dropped {
            self.push(BlufiEvent::DeviceStatus(BlufiStatus {
                op_mode: radar.op_mode,
                sta_connected: radar.sta_connected,
                sta_ssid: radar.sta_ssid,
                sta_bssid: None,
                softap_connection_count: 0,
            }));
        }
        Ok(())
    }

    async fn request_device_version(&self) -> Result<(), BlufiFault> {
        let (_, radar) = self.open_radar()?;
        self.push(BlufiEvent::DeviceVersion(radar.version));
        Ok(())
    }

    async fn next_event(&self) -> Result<BlufiEvent, BlufiFault> {
        loop {
            let next = {
                let mut s = lock(&self.state);
                if s.open.is_none() {
                    return Err(BlufiFault::new(blufi::CODE_DISCONNECTED, "link closed"));
                }
                s.events.pop_front()
            };
            if let Some(event) = next {
                return Ok(event);
            }
            self.notify.notified().await;
        }
    }

    async fn discard_pending(&self) {
        let mut s = lock(&self.state);
        if !s.events.is_empty() {
            s.discarded += s.events.len();
            s.events.clear();
        }
    }

    async fn close(&self) {
        {
            let mut s = lock(&self.state);
            s.open = None;
            s.negotiated = false;
            s.events.clear();
        }
        self.notify.notify_one();
    }
}

// ============================================================================
// Sleepace client
// ============================================================================

#[derive(Clone, Debug, Default)]
struct BoardModel {
    ssid: Option<String>,
    connected: bool,
    mac: Option<String>,
    server: Option<ServerEndpoint>,
    firmware: Option<String>,
}

#[derive(Default)]
struct SleepaceSim {
    powered: bool,
    peripherals: Vec<SleepacePeripheral>,
    boards: HashMap<String, BoardModel>,
    scan_tx: Option<mpsc::UnboundedSender<SleepacePeripheral>>,
    connected: Option<String>,
    handshaken: bool,
    pending_ack: Option<SleepaceAck>,
    ack: SimAck,
    handshake_hangs: bool,
    status_drops: usize,
    wire_writes: usize,
}

pub struct SimSleepaceClient {
    state: Mutex<SleepaceSim>,
    notify: Notify,
}

impl Default for SimSleepaceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSleepaceClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SleepaceSim {
                powered: true,
                ..SleepaceSim::default()
            }),
            notify: Notify::new(),
        }
    }

    pub fn add_board(&self, peripheral_id: &str, name: &str, rssi: i32) {
        let peripheral = SleepacePeripheral {
            peripheral_id: peripheral_id.to_string(),
            name: name.to_string(),
            device_code: Some(format!("SA-{peripheral_id}")),
            mac_address: None,
            rssi: Some(rssi),
        };
        let mut s = lock(&self.state);
        s.boards.insert(
            peripheral_id.to_string(),
            BoardModel {
                firmware: Some("2.1.7".to_string()),
                ..BoardModel::default()
            },
        );
        s.peripherals.retain(|p| p.peripheral_id != peripheral_id);
        s.peripherals.push(peripheral.clone());
        if let Some(tx) = &s.scan_tx {
            let _ = tx.send(peripheral);
        }
    }

    pub fn set_powered(&self, powered: bool) {
        lock(&self.state).powered = powered;
    }

    /// The board goes out of range and stops showing up in scans.
    pub fn vanish(&self, peripheral_id: &str) {
        lock(&self.state).peripherals.retain(|p| p.peripheral_id != peripheral_id);
    }

    pub fn set_ack(&self, ack: SimAck) {
        lock(&self.state).ack = ack;
    }

    pub fn set_handshake_hangs(&self, hangs: bool) {
        lock(&self.state).handshake_hangs = hangs;
    }

    /// Leave the next `n` WiFi status queries unanswered.
    pub fn drop_status_requests(&self, n: usize) {
        lock(&self.state).status_drops = n;
    }

    pub fn wire_writes(&self) -> usize {
        lock(&self.state).wire_writes
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }

    fn require_link(&self) -> Result<String, SleepaceFault> {
        lock(&self.state)
            .connected
            .clone()
            .ok_or_else(|| SleepaceStatus::Disconnected.into())
    }
}

#[async_trait]
impl SleepaceClient for SimSleepaceClient {
    async fn bluetooth_enabled(&self) -> bool {
        lock(&self.state).powered
    }

    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<SleepacePeripheral>, SleepaceFault> {
        let mut s = lock(&self.state);
        if !s.powered {
            return Err(SleepaceStatus::BluetoothOff.into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for p in &s.peripherals {
            let _ = tx.send(p.clone());
        }
        s.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) {
        lock(&self.state).scan_tx = None;
    }

    async fn connect(&self, peripheral: &SleepacePeripheral) -> Result<(), SleepaceFault> {
        let mut s = lock(&self.state);
        if !s.powered {
            return Err(SleepaceStatus::BluetoothOff.into());
        }
        if !s.boards.contains_key(&peripheral.peripheral_id) {
            return Err(SleepaceStatus::NotFound.into());
        }
        s.connected = Some(peripheral.peripheral_id.clone());
        s.handshaken = false;
        s.pending_ack = None;
        Ok(())
    }

    async fn handshake(&self) -> Result<(), SleepaceFault> {
        self.require_link()?;
        let hangs = {
            let mut s = lock(&self.state);
            if !s.handshake_hangs {
                s.handshaken = true;
            }
            s.handshake_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn send_config_frame(&self, frame: &SleepaceConfigFrame) -> Result<(), SleepaceFault> {
        let id = self.require_link()?;
        {
            let mut s = lock(&self.state);
            if !s.handshaken {
                return Err(SleepaceStatus::Unauthorized.into());
            }
            s.wire_writes += 1;
            let ack = s.ack;
            s.pending_ack = match ack {
                SimAck::Silent => None,
                SimAck::Reject(code) => Some(SleepaceAck {
                    status: SleepaceStatus::from_code(code),
                    message: Some("frame rejected".to_string()),
                }),
                SimAck::Normal => {
                    if let Some(board) = s.boards.get_mut(&id) {
                        if let Some(ssid) = &frame.wifi_ssid {
                            board.ssid = Some(ssid.clone());
                            board.connected = true;
                        }
                        if let Some(address) = &frame.server_address {
                            board.server = Some(ServerEndpoint {
                                address: address.clone(),
                                port: frame.server_port,
                                protocol: frame.server_protocol.unwrap_or(DEFAULT_SERVER_PROTOCOL),
                            });
                        }
                    }
                    Some(SleepaceAck {
                        status: SleepaceStatus::Succeed,
                        message: None,
                    })
                }
            };
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn await_ack(&self) -> Result<SleepaceAck, SleepaceFault> {
        loop {
            let ack = {
                let mut s = lock(&self.state);
                if s.connected.is_none() {
                    return Err(SleepaceStatus::Disconnected.into());
                }
                s.pending_ack.take()
            };
            if let Some(ack) = ack {
                return Ok(ack);
            }
            self.notify.notified().await;
        }
    }

    async fn query_wifi_status(&self) -> Result<SleepaceWifiStatus, SleepaceFault> {
        let id = self.require_link()?;
        let (dropped, board) = {
            let mut s = lock(&self.state);
            let dropped = s.status_drops > 0;
            if dropped {
                s.status_drops -= 1;
            }
            (dropped, s.boards.get(&id).cloned().unwrap_or_default())
        };
        if dropped {
            std::future::pending::<()>().await;
        }
        Ok(SleepaceWifiStatus {
            connected: board.connected,
            ssid: board.ssid,
            mac_address: board.mac,
            rssi: board.connected.then_some(-62),
            server_address: board.server.as_ref().map(|e| e.address.clone()),
            server_port: board.server.as_ref().map(|e| e.port),
            server_protocol: board.server.as_ref().map(|e| e.protocol),
            server_connected: board.connected && board.server.is_some(),
            firmware_version: board.firmware,
        })
    }

    async fn disconnect(&self) {
        {
            let mut s = lock(&self.state);
            s.connected = None;
            s.handshaken = false;
            s.pending_ack = None;
        }
        self.notify.notify_one();
    }
}
