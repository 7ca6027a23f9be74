// Radar adapter (BluFi)
//
// Serves RadarQl and generic ESP BluFi devices. Discovery goes through the
// platform central; the link, key exchange and encrypted frames go through
// the BluFi binding. Server settings travel as a JSON custom-data payload.

use super::blufi::{self, BlufiClient, BlufiEvent, BlufiFault, BlufiOpMode, BlufiStationParams, BlufiStatus};
use super::session::{self, CancelSignal, ConnectPlan, SessionCore};
use super::{
    check_family, AdapterFamily, AdapterState, CompletionCallback, ErrorCallback, ScanStream,
    SessionEvent, VendorAdapter,
};
use crate::ble_common::{Advertisement, BleCentral};
use crate::config::Timeouts;
use crate::error::{ErrorKind, ProvisionError, ProvisionResult};
use crate::filter::{accepts, effective_timeout, DiscoveryFilter};
use crate::models::{
    ConfigureReport, ConfigureRequest, DeviceRecord, ServerEndpoint, ServerProtocol, ServerState,
    SignalStrength, StepOutcome, ValidatedConfig, Vendor, WifiCredentials, WifiMode, WifiState,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Advertised name prefix of stock ESP BluFi firmware.
const ESP_BLUFI_NAME_PREFIX: &str = "BLUFI";

// ============================================================================
// Custom-data payloads
// ============================================================================

#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum RadarCommand<'a> {
    SetServer {
        address: &'a str,
        port: u16,
        protocol: ServerProtocol,
    },
    GetStatus,
}

#[derive(Debug, Deserialize, Default)]
struct RadarServerInfo {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct RadarReply {
    code: i32,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    server: Option<RadarServerInfo>,
    #[serde(default)]
    wifi_rssi: Option<i32>,
    #[serde(default)]
    mac: Option<String>,
}

fn parse_reply(data: &[u8]) -> ProvisionResult<RadarReply> {
    serde_json::from_slice(data).map_err(|e| {
        tlog!("[radar] Unreadable custom-data reply {}: {e}", hex::encode(data));
        ProvisionError::new(
            ErrorKind::DataTransmissionError,
            "The radar sent a reply that could not be read",
        )
    })
}

fn wifi_mode(mode: BlufiOpMode) -> Option<WifiMode> {
    match mode {
        BlufiOpMode::Null => None,
        BlufiOpMode::Sta => Some(WifiMode::Station),
        BlufiOpMode::SoftAp => Some(WifiMode::AccessPoint),
        BlufiOpMode::StaSoftAp => Some(WifiMode::StationAp),
    }
}

fn record_from_advertisement(adv: Advertisement) -> DeviceRecord {
    let name = adv.local_name.clone().unwrap_or_else(|| adv.peripheral_id.clone());
    let vendor = if name.starts_with(ESP_BLUFI_NAME_PREFIX) {
        Vendor::EspBle
    } else {
        Vendor::RadarQl
    };
    let rssi = SignalStrength::from_reading(adv.rssi.map(i32::from));
    let mut record = DeviceRecord::discovered(vendor, adv.peripheral_id.clone(), name, rssi);
    record.mac_address = adv.address;
    if Uuid::parse_str(&adv.peripheral_id).is_ok() {
        record.uuid = Some(adv.peripheral_id);
    }
    record
}

// ============================================================================
// Adapter
// ============================================================================

pub struct RadarAdapter {
    central: Arc<dyn BleCentral>,
    client: Arc<dyn BlufiClient>,
    timeouts: Timeouts,
    core: Arc<SessionCore>,
}

impl RadarAdapter {
    pub fn new(central: Arc<dyn BleCentral>, client: Arc<dyn BlufiClient>, timeouts: Timeouts) -> Self {
        Self {
            central,
            client,
            timeouts,
            core: Arc::new(SessionCore::new("radar")),
        }
    }

    async fn ensure_radio(&self) -> ProvisionResult<()> {
        if self.central.radio_powered().await? {
            Ok(())
        } else {
            Err(ProvisionError::bluetooth_disabled())
        }
    }

    // ---- scan ---------------------------------------------------------------

    async fn open_scan(
        &self,
        timeout: Option<Duration>,
        filter: Option<DiscoveryFilter>,
    ) -> ProvisionResult<ScanStream> {
        self.ensure_radio().await?;
        let (generation, stop_rx) = self.core.begin_scan()?;
        let adverts = match self.central.start_discovery().await {
            Ok(rx) => rx,
            Err(e) => {
                self.core.finish_scan(generation);
                return Err(e);
            }
        };

        let window = effective_timeout(timeout, self.timeouts.scan);
        match &filter {
            Some(f) => tlog!("[radar] Scan started for {window:?} ({:?} \"{}\")", f.filter_type, f.value),
            None => tlog!("[radar] Scan started for {window:?} (no filter)"),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scan(
            self.core.clone(),
            self.central.clone(),
            adverts,
            filter,
            window,
            stop_rx,
            tx,
            generation,
        ));

        let core = self.core.clone();
        Ok(ScanStream::new(rx).on_end(move || core.stop_scan_generation(generation)))
    }

    // ---- connect ------------------------------------------------------------

    async fn establish(&self, device: &DeviceRecord, cancel: &CancelSignal) -> ProvisionResult<DeviceRecord> {
        let id = device.device_id();
        if !self.central.is_known(id).await? {
            return Err(ProvisionError::not_found(format!(
                "{id} was not found. Make sure it is powered on and in range, then scan again."
            )));
        }

        tlog!("[radar] Connecting to {id}...");
        session::guarded(
            cancel,
            self.timeouts.connect,
            || ProvisionError::new(ErrorKind::ConnectionTimeout, format!("Connecting to {id} timed out")),
            self.open_link(id),
        )
        .await?;
        tlog!("[radar] Connected to {id}");

        let mut record = device.clone();
        match session::guarded(
            cancel,
            self.timeouts.query,
            || ProvisionError::new(ErrorKind::DataTransmissionError, "Version read timed out"),
            self.version_exchange(),
        )
        .await
        {
            Ok(version) => record.version = Some(version),
            Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
            // Older firmware does not answer the version request
            Err(e) => tlog!("[radar] Firmware version unavailable for {id}: {e}"),
        }
        record.last_update = Some(chrono::Utc::now());
        Ok(record)
    }

    async fn open_link(&self, id: &str) -> ProvisionResult<()> {
        Ok(self.client.open(id).await?)
    }

    // ---- exchanges ----------------------------------------------------------

    /// Wait for the next event accepted by `pick`, skipping unrelated ones.
    async fn await_event<T>(&self, what: &str, pick: impl Fn(BlufiEvent) -> Option<T>) -> ProvisionResult<T> {
        loop {
            let event = self.client.next_event().await?;
            if let BlufiEvent::Error { code } = event {
                return Err(BlufiFault::new(code, format!("error report while waiting for {what}")).into());
            }
            let label = format!("{event:?}");
            match pick(event) {
                Some(value) => return Ok(value),
                None => tlog!("[radar] Ignoring {label} while waiting for {what}"),
            }
        }
    }

    async fn version_exchange(&self) -> ProvisionResult<String> {
        self.client.discard_pending().await;
        self.client.request_device_version().await?;
        self.await_event("version", |e| match e {
            BlufiEvent::DeviceVersion(v) => Some(v),
            _ => None,
        })
        .await
    }

    async fn status_exchange(&self) -> ProvisionResult<BlufiStatus> {
        self.client.discard_pending().await;
        self.client.request_device_status().await?;
        self.await_event("device status", |e| match e {
            BlufiEvent::DeviceStatus(s) => Some(s),
            _ => None,
        })
        .await
    }

    async fn custom_exchange(&self, command: RadarCommand<'_>) -> ProvisionResult<RadarReply> {
        let payload = serde_json::to_vec(&command)
            .map_err(|e| ProvisionError::invalid(format!("Cannot encode radar command: {e}")))?;
        self.client.discard_pending().await;
        self.client.post_custom_data(&payload).await?;
        let data = self
            .await_event("custom-data reply", |e| match e {
                BlufiEvent::CustomData(d) => Some(d),
                _ => None,
            })
            .await?;
        parse_reply(&data)
    }

    async fn negotiate(&self) -> ProvisionResult<()> {
        Ok(self.client.negotiate_security().await?)
    }

    async fn wifi_exchange(&self, creds: &WifiCredentials) -> ProvisionResult<StepOutcome> {
        let params = BlufiStationParams {
            op_mode: BlufiOpMode::Sta,
            sta_ssid: creds.ssid.clone(),
            sta_password: creds.password.clone(),
        };
        self.client.discard_pending().await;
        self.client.post_configure(&params).await?;
        let status = self
            .await_event("WiFi acknowledgement", |e| match e {
                BlufiEvent::PostConfigureParams { status } => Some(status),
                _ => None,
            })
            .await?;
        if status == blufi::CODE_SUCCESS {
            Ok(StepOutcome::ok(format!("WiFi credentials for \"{}\" accepted", creds.ssid)))
        } else {
            Err(BlufiFault::new(status, "WiFi configuration rejected").into())
        }
    }

    async fn server_exchange(&self, endpoint: &ServerEndpoint) -> ProvisionResult<StepOutcome> {
        let reply = self
            .custom_exchange(RadarCommand::SetServer {
                address: &endpoint.address,
                port: endpoint.port,
                protocol: endpoint.protocol,
            })
            .await?;
        if reply.code == blufi::CODE_SUCCESS {
            Ok(StepOutcome::ok(format!(
                "Server set to {}:{} ({})",
                endpoint.address, endpoint.port, endpoint.protocol
            )))
        } else {
            Err(ProvisionError::new(
                ErrorKind::Unknown,
                format!(
                    "The radar rejected the server settings: {} (code {})",
                    reply.msg.as_deref().unwrap_or("no reason given"),
                    reply.code
                ),
            ))
        }
    }

    // ---- configure ----------------------------------------------------------

    async fn run_configure(
        &self,
        device_id: &str,
        config: &ValidatedConfig,
        cancel: &CancelSignal,
    ) -> ProvisionResult<ConfigureReport> {
        tlog!("[radar] Negotiating security with {device_id}");
        session::guarded(
            cancel,
            self.timeouts.negotiate,
            || {
                ProvisionError::new(
                    ErrorKind::SecurityNegotiationFailed,
                    format!("Security negotiation with {device_id} timed out"),
                )
            },
            self.negotiate(),
        )
        .await?;

        let ack_timeout = |what: &'static str| {
            move || {
                ProvisionError::new(
                    ErrorKind::DataTransmissionError,
                    format!("The radar did not acknowledge the {what} settings"),
                )
            }
        };

        let wifi = match &config.wifi {
            Some(creds) => {
                tlog!("[radar] Sending WiFi credentials for \"{}\"", creds.ssid);
                Some(
                    session::guarded(cancel, self.timeouts.ack, ack_timeout("WiFi"), self.wifi_exchange(creds))
                        .await,
                )
            }
            None => None,
        };
        if let Some(Err(e)) = &wifi {
            if e.kind.is_fatal() || e.kind == ErrorKind::Cancelled {
                return Err(e.clone());
            }
        }

        let server = match &config.server {
            Some(endpoint) => {
                tlog!("[radar] Sending server {}:{} ({})", endpoint.address, endpoint.port, endpoint.protocol);
                Some(
                    session::guarded(cancel, self.timeouts.ack, ack_timeout("server"), self.server_exchange(endpoint))
                        .await,
                )
            }
            None => None,
        };

        aggregate_steps(device_id, wifi, server)
    }

    // ---- query --------------------------------------------------------------

    async fn run_query(&self, device: &DeviceRecord, cancel: &CancelSignal) -> ProvisionResult<DeviceRecord> {
        let limit = self.timeouts.query;
        let retries = self.timeouts.query_retries;
        let status = session::read_with_retry(cancel, limit, retries, "device status", || self.status_exchange()).await?;
        let reply = session::read_with_retry(cancel, limit, retries, "server status", || {
            self.custom_exchange(RadarCommand::GetStatus)
        })
        .await?;

        let wifi = WifiState {
            ssid: status.sta_ssid.filter(|s| !s.is_empty()),
            connected: status.sta_connected,
            mode: wifi_mode(status.op_mode),
            signal: SignalStrength::from_reading(reply.wifi_rssi),
            mac_address: reply.mac,
        };
        let server = reply.server.map(|s| ServerState {
            address: s.address.filter(|a| !a.is_empty()),
            port: s.port.filter(|p| *p != 0),
            protocol: s.protocol.as_deref().and_then(ServerProtocol::parse),
            connected: s.connected,
        });
        tlog!(
            "[radar] Status of {}: ssid={:?} connected={} server={:?}",
            device.device_id(),
            wifi.ssid,
            wifi.connected,
            server.as_ref().and_then(|s| s.address.as_deref())
        );
        Ok(device.refreshed(Some(wifi), server))
    }
}

/// Fold the two independent step results into one outcome. A failed step
/// does not undo the other; the error message says what was applied.
pub(crate) fn aggregate_steps(
    device_id: &str,
    wifi: Option<ProvisionResult<StepOutcome>>,
    server: Option<ProvisionResult<StepOutcome>>,
) -> ProvisionResult<ConfigureReport> {
    let first_err = [wifi.as_ref(), server.as_ref()]
        .into_iter()
        .flatten()
        .find_map(|r| r.as_ref().err().cloned());

    match first_err {
        None => {
            let wifi = wifi.and_then(Result::ok);
            let server = server.and_then(Result::ok);
            Ok(ConfigureReport::from_steps(device_id, wifi, server))
        }
        Some(err) => {
            let applied: Vec<&str> = [
                wifi.as_ref().filter(|r| r.is_ok()).map(|_| "WiFi"),
                server.as_ref().filter(|r| r.is_ok()).map(|_| "server"),
            ]
            .into_iter()
            .flatten()
            .collect();
            let message = if applied.is_empty() {
                err.message
            } else {
                format!("{} ({} settings were applied)", err.message, applied.join(" and "))
            };
            Err(ProvisionError::new(err.kind, message))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    core: Arc<SessionCore>,
    central: Arc<dyn BleCentral>,
    mut adverts: mpsc::UnboundedReceiver<Advertisement>,
    filter: Option<DiscoveryFilter>,
    window: Duration,
    mut stop: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<DeviceRecord>,
    generation: u64,
) {
    let deadline = tokio::time::Instant::now() + window;
    let mut matched = 0usize;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tlog!("[radar] Scan window elapsed");
                break;
            }
            _ = stop.wait_for(|s| *s) => {
                tlog!("[radar] Scan stopped");
                break;
            }
            adv = adverts.recv() => match adv {
                Some(adv) => {
                    if !accepts(filter.as_ref(), &adv) {
                        continue;
                    }
                    matched += 1;
                    if tx.send(record_from_advertisement(adv)).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    if let Err(e) = central.stop_discovery().await {
        tlog!("[radar] Failed to stop discovery: {e}");
    }
    core.finish_scan(generation);
    tlog!("[radar] Scan finished ({matched} matching advertisements)");
    core.emit(&SessionEvent::ScanFinished {
        family: AdapterFamily::Radar,
    });
}

#[async_trait]
impl VendorAdapter for RadarAdapter {
    fn family(&self) -> AdapterFamily {
        AdapterFamily::Radar
    }

    fn supports_filtering(&self) -> bool {
        true
    }

    fn state(&self) -> AdapterState {
        self.core.state()
    }

    fn current_device(&self) -> Option<String> {
        self.core.device_id()
    }

    async fn start_scan(
        &self,
        timeout: Option<Duration>,
        filter: Option<DiscoveryFilter>,
    ) -> ProvisionResult<ScanStream> {
        let result = self.open_scan(timeout, filter).await;
        if let Err(e) = &result {
            self.core.emit_error(e);
        }
        result
    }

    async fn stop_scan(&self) {
        self.core.request_stop_scan();
    }

    async fn connect(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord> {
        let plan = match check_family(AdapterFamily::Radar, device) {
            Ok(()) => match self.ensure_radio().await {
                Ok(()) => self.core.prepare_connect(device.device_id()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (ticket, previous) = match plan {
            Ok(ConnectPlan::AlreadyConnected) => {
                tlog!("[radar] Already connected to {}", device.device_id());
                return Ok(device.clone());
            }
            Ok(ConnectPlan::Proceed { ticket, previous }) => (ticket, previous),
            Err(e) => {
                self.core.emit_error(&e);
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            tlog!("[radar] Dropping {previous} before connecting to {}", device.device_id());
            self.client.close().await;
            self.core.emit(&SessionEvent::Disconnected { device_id: previous });
        }

        let result = self.establish(device, &ticket.cancel).await;
        if result.is_err() && self.core.is_current(ticket.generation) {
            self.client.close().await;
        }
        self.core.finish(
            ticket.generation,
            result,
            |_| AdapterState::Idle,
            |record| SessionEvent::Connected(record.clone()),
        )
    }

    async fn configure(
        &self,
        device: &DeviceRecord,
        request: &ConfigureRequest,
    ) -> ProvisionResult<ConfigureReport> {
        // Validation happens before any wire traffic or state change
        let prepared = request.validate().and_then(|config| {
            let ticket = self.core.begin_op(AdapterState::Configuring, device.device_id())?;
            Ok((config, ticket))
        });
        let (config, ticket) = match prepared {
            Ok(v) => v,
            Err(e) => {
                self.core.emit_error(&e);
                return Err(e);
            }
        };

        let result = self.run_configure(device.device_id(), &config, &ticket.cancel).await;
        if matches!(&result, Err(e) if e.kind.is_fatal()) && self.core.is_current(ticket.generation) {
            self.client.close().await;
        }
        self.core.finish(
            ticket.generation,
            result,
            session::state_after_failure,
            |report| SessionEvent::Configured(report.clone()),
        )
    }

    async fn query_status(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord> {
        let ticket = match self.core.begin_op(AdapterState::Querying, device.device_id()) {
            Ok(t) => t,
            Err(e) => {
                self.core.emit_error(&e);
                return Err(e);
            }
        };
        let result = self.run_query(device, &ticket.cancel).await;
        if matches!(&result, Err(e) if e.kind.is_fatal()) && self.core.is_current(ticket.generation) {
            self.client.close().await;
        }
        self.core.finish(
            ticket.generation,
            result,
            session::state_after_failure,
            |record| SessionEvent::StatusUpdated(record.clone()),
        )
    }

    async fn disconnect(&self) {
        if let Some(device_id) = self.core.disconnect() {
            tlog!("[radar] Disconnecting from {device_id}");
            self.client.close().await;
            self.core.emit(&SessionEvent::Disconnected { device_id });
        }
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.core.set_error_callback(callback);
    }

    fn set_completion_callback(&self, callback: CompletionCallback) {
        self.core.set_completion_callback(callback);
    }

    fn notify_error(&self, error: &ProvisionError) {
        self.core.emit_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::Recorder;
    use crate::filter::FilterType;
    use crate::sim::{SimAck, SimBlufiClient, SimCentral};
    use futures::StreamExt;

    struct Bench {
        central: Arc<SimCentral>,
        client: Arc<SimBlufiClient>,
        adapter: RadarAdapter,
        recorder: Arc<Recorder>,
    }

    fn bench() -> Bench {
        let central = Arc::new(SimCentral::new());
        let client = Arc::new(SimBlufiClient::new());
        for (id, name, rssi) in [("rx-1", "RX-1", -40), ("rx-2", "RX-2", -55), ("zz-9", "ZZ-9", -60)] {
            central.advertise(id, Some(name), rssi);
            client.add_radar(id, "1.4.2", "AA:BB:CC:00:00:01");
        }
        let adapter = RadarAdapter::new(central.clone(), client.clone(), Timeouts::default());
        let recorder = Recorder::attach(&adapter);
        Bench {
            central,
            client,
            adapter,
            recorder,
        }
    }

    fn radar(id: &str) -> DeviceRecord {
        DeviceRecord::discovered(Vendor::RadarQl, id, id.to_uppercase(), SignalStrength::UNAVAILABLE)
    }

    async fn connected(b: &Bench, id: &str) -> DeviceRecord {
        b.adapter.connect(&radar(id)).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_with_name_filter() {
        let b = bench();
        let stream = b
            .adapter
            .start_scan(Some(Duration::from_secs(2)), Some(DiscoveryFilter::name_prefix("RX")))
            .await
            .unwrap();
        let mut ids: Vec<String> = stream.map(|r| r.device_id().to_string()).collect().await;
        ids.sort();
        assert_eq!(ids, vec!["rx-1", "rx-2"]);
        assert_eq!(b.adapter.state(), AdapterState::Idle);
        assert!(!b.central.is_discovering());
        assert_eq!(
            b.recorder.count_events(|e| matches!(e, SessionEvent::ScanFinished { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_reemits_with_fresh_signal() {
        let b = bench();
        let stream = b
            .adapter
            .start_scan(Some(Duration::from_secs(2)), Some(DiscoveryFilter::name_prefix("RX")))
            .await
            .unwrap();
        b.central.advertise("rx-1", Some("RX-1"), -30);

        let found: Vec<DeviceRecord> = stream.collect().await;
        let rx1: Vec<Option<i32>> = found
            .iter()
            .filter(|r| r.device_id() == "rx-1")
            .map(|r| r.rssi.dbm())
            .collect();
        assert_eq!(rx1, vec![Some(-40), Some(-30)]);
        assert_eq!(found.iter().filter(|r| r.device_id() == "rx-2").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_filter_by_mac() {
        let b = bench();
        b.central.advertise_full(Advertisement {
            peripheral_id: "mac-dev".into(),
            local_name: None,
            address: Some("11:22:33:44:55:66".into()),
            services: Vec::new(),
            rssi: Some(-70),
        });
        let filter = DiscoveryFilter::new(FilterType::Mac, "112233");
        let stream = b.adapter.start_scan(Some(Duration::from_secs(1)), Some(filter)).await.unwrap();
        let found: Vec<DeviceRecord> = stream.collect().await;
        assert_eq!(found.len(), 1);
        // No advertised name: the peripheral id stands in
        assert_eq!(found[0].name, "mac-dev");
        assert_eq!(found[0].mac_address.as_deref(), Some("11:22:33:44:55:66"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_is_busy() {
        let b = bench();
        let first = b.adapter.start_scan(None, None).await.unwrap();
        let err = b.adapter.start_scan(None, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        assert_eq!(b.recorder.error_kinds(), vec![ErrorKind::Busy]);

        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.adapter.state(), AdapterState::Idle);
        assert!(b.adapter.start_scan(None, None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_with_radio_off() {
        let b = bench();
        b.central.set_powered(false);
        let err = b.adapter.start_scan(None, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BluetoothDisabled);
        assert_eq!(b.adapter.state(), AdapterState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reads_version() {
        let b = bench();
        let record = connected(&b, "rx-1").await;
        assert_eq!(record.version.as_deref(), Some("1.4.2"));
        assert_eq!(b.adapter.state(), AdapterState::Connected);
        assert_eq!(b.adapter.current_device().as_deref(), Some("rx-1"));
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Connected(_))), 1);

        // Same device again is a no-op
        b.adapter.connect(&radar("rx-1")).await.unwrap();
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Connected(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_stops_running_scan() {
        let b = bench();
        let started = tokio::time::Instant::now();
        let stream = b.adapter.start_scan(None, None).await.unwrap();
        connected(&b, "rx-2").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!b.central.is_discovering());

        // Nothing seen after the connect may reach the old stream
        b.central.advertise("rx-3", Some("RX-3"), -35);
        let rest: Vec<DeviceRecord> = stream.collect().await;
        assert!(rest.iter().all(|d| d.device_id() != "rx-3"));
        assert!(started.elapsed() < Timeouts::default().scan);
        assert_eq!(b.adapter.state(), AdapterState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_other_device_drops_previous() {
        let b = bench();
        connected(&b, "rx-1").await;
        connected(&b, "rx-2").await;
        assert_eq!(b.adapter.current_device().as_deref(), Some("rx-2"));
        assert!(b.recorder.events().contains(&SessionEvent::Disconnected {
            device_id: "rx-1".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures() {
        let b = bench();
        let err = b.adapter.connect(&radar("ghost")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceNotFound);
        assert_eq!(b.adapter.state(), AdapterState::Idle);

        b.central.vanish("rx-2");
        let err = b.adapter.connect(&radar("rx-2")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceNotFound);

        b.central.set_powered(false);
        let err = b.adapter.connect(&radar("rx-1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BluetoothDisabled);

        let sleep_board = DeviceRecord::discovered(Vendor::SleepBoardHs, "sb", "SB", SignalStrength::UNAVAILABLE);
        let err = b.adapter.connect(&sleep_board).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert_eq!(b.recorder.error_kinds().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_returns_to_idle() {
        let b = bench();
        b.client.set_open_hangs(true);
        let err = b.adapter.connect(&radar("rx-1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionTimeout);
        assert_eq!(b.adapter.state(), AdapterState::Idle);
        assert!(b.adapter.current_device().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_configure_sends_nothing() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        let writes = b.client.wire_writes();

        let err = b.adapter.configure(&device, &ConfigureRequest::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert_eq!(b.client.wire_writes(), writes);
        assert_eq!(b.adapter.state(), AdapterState::Connected);
        assert_eq!(b.recorder.error_kinds(), vec![ErrorKind::InvalidParameter]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_then_query_round_trip() {
        let b = bench();
        let device = connected(&b, "rx-1").await;

        let request = ConfigureRequest::wifi("Home", Some("secret")).with_server("10.0.0.5", 9100, Some(ServerProtocol::Udp));
        let report = b.adapter.configure(&device, &request).await.unwrap();
        assert!(report.success);
        assert!(report.wifi.as_ref().is_some_and(|s| s.success));
        assert!(report.server.as_ref().is_some_and(|s| s.success));
        assert_eq!(b.adapter.state(), AdapterState::Connected);

        let status = b.adapter.query_status(&device).await.unwrap();
        assert_eq!(status.wifi_ssid(), Some("Home"));
        assert!(status.wifi_connected());
        assert!(status.wifi_signal().is_available());
        let server = status.server.as_ref().unwrap();
        assert_eq!(server.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(server.port, Some(9100));
        assert_eq!(server.protocol, Some(ServerProtocol::Udp));
        assert_eq!(status.version.as_deref(), Some("1.4.2"));
        assert!(status.last_update.is_some());

        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Configured(_))), 1);
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::StatusUpdated(_))), 1);
        assert!(b.recorder.error_kinds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_reports_unassociated_radar() {
        let b = bench();
        b.client.set_associate_on_configure(false);
        let device = connected(&b, "rx-1").await;
        b.adapter
            .configure(&device, &ConfigureRequest::wifi("Home", None))
            .await
            .unwrap();
        let status = b.adapter.query_status(&device).await.unwrap();
        assert_eq!(status.wifi_ssid(), Some("Home"));
        assert!(!status.wifi_connected());
        assert!(!status.wifi_signal().is_available());
        assert!(status.server.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_is_transmission_error() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        b.client.set_ack(SimAck::Silent);

        let err = b
            .adapter
            .configure(&device, &ConfigureRequest::wifi("Home", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataTransmissionError);
        assert_eq!(b.adapter.state(), AdapterState::Connected);
        assert_eq!(b.recorder.error_kinds(), vec![ErrorKind::DataTransmissionError]);
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Configured(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_is_not_taken_for_the_next_configure() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        b.client.set_ack(SimAck::Silent);

        let first = b.adapter.configure(&device, &ConfigureRequest::wifi("Old", None)).await;
        assert_eq!(first.unwrap_err().kind, ErrorKind::DataTransmissionError);

        // The radar answers the first frame after we gave up, then keeps
        // ignoring new frames
        b.client.deliver_late_ack(blufi::CODE_SUCCESS);
        let second = b.adapter.configure(&device, &ConfigureRequest::wifi("New", None)).await;
        assert_eq!(second.unwrap_err().kind, ErrorKind::DataTransmissionError);
        assert!(b.client.discarded_events() >= 1);
        assert_eq!(
            b.recorder.error_kinds(),
            vec![ErrorKind::DataTransmissionError, ErrorKind::DataTransmissionError]
        );
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Configured(_))), 0);

        let status = b.adapter.query_status(&device).await.unwrap();
        assert!(status.wifi_ssid().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_wifi_maps_blufi_code() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        b.client.set_ack(SimAck::Reject(blufi::CODE_CONF_ERR_POST_STA));
        let err = b
            .adapter
            .configure(&device, &ConfigureRequest::wifi("Home", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataTransmissionError);
        assert!(err.message.contains("-3002"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        b.client.set_negotiation_hangs(true);
        let err = b
            .adapter
            .configure(&device, &ConfigureRequest::server("10.0.0.5", 9100, None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SecurityNegotiationFailed);
        assert_eq!(b.adapter.state(), AdapterState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_configure_once() {
        let b = bench();
        let device = connected(&b, "rx-1").await;
        b.client.set_negotiation_hangs(true);

        let request = ConfigureRequest::wifi("Home", Some("secret"));
        let (result, _) = tokio::join!(b.adapter.configure(&device, &request), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            b.adapter.disconnect().await;
        });

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(b.recorder.error_kinds(), vec![ErrorKind::Cancelled]);
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Configured(_))), 0);
        assert_eq!(b.adapter.state(), AdapterState::Idle);
        assert!(!b.client.is_open());

        // A second disconnect is a no-op
        b.adapter.disconnect().await;
        assert_eq!(
            b.recorder.count_events(|e| matches!(e, SessionEvent::Disconnected { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_elsewhere_cancels_pending_configure_once() {
        let b = bench();
        let first = connected(&b, "rx-1").await;
        b.client.set_ack(SimAck::Silent);

        let request = ConfigureRequest::wifi("Home", None);
        let (configured, second) = tokio::join!(b.adapter.configure(&first, &request), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            b.adapter.connect(&radar("rx-2")).await
        });

        assert_eq!(configured.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(second.unwrap().device_id(), "rx-2");
        assert_eq!(b.recorder.error_kinds(), vec![ErrorKind::Cancelled]);
        assert_eq!(b.recorder.count_events(|e| matches!(e, SessionEvent::Configured(_))), 0);
        assert_eq!(
            b.recorder.count_events(
                |e| matches!(e, SessionEvent::Disconnected { device_id } if device_id == "rx-1")
            ),
            1
        );
        assert_eq!(b.adapter.state(), AdapterState::Connected);
        assert_eq!(b.adapter.current_device().as_deref(), Some("rx-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_requires_connection() {
        let b = bench();
        let err = b.adapter.query_status(&radar("rx-1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceNotFound);

        connected(&b, "rx-1").await;
        let err = b.adapter.query_status(&radar("rx-2")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_retries_once_on_timeout() {
        let b = bench();
        let device = connected(&b, "rx-1").await;

        b.client.drop_status_requests(1);
        assert!(b.adapter.query_status(&device).await.is_ok());

        b.client.drop_status_requests(2);
        let err = b.adapter.query_status(&device).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataTransmissionError);
        assert_eq!(b.adapter.state(), AdapterState::Connected);
    }

    #[test]
    fn test_esp_devices_are_tagged() {
        let rec = record_from_advertisement(Advertisement {
            peripheral_id: "8F2C6C1E-0D53-4B3A-9C1E-3B7F5D2A9E10".into(),
            local_name: Some("BLUFI_DEVICE".into()),
            address: None,
            services: Vec::new(),
            rssi: Some(-50),
        });
        assert_eq!(rec.vendor(), Vendor::EspBle);
        assert!(rec.uuid.is_some());
    }

    #[test]
    fn test_set_server_payload() {
        let json = serde_json::to_string(&RadarCommand::SetServer {
            address: "10.0.0.5",
            port: 9100,
            protocol: ServerProtocol::Tcp,
        })
        .unwrap();
        assert_eq!(json, r#"{"cmd":"set_server","address":"10.0.0.5","port":9100,"protocol":"TCP"}"#);
        assert_eq!(serde_json::to_string(&RadarCommand::GetStatus).unwrap(), r#"{"cmd":"get_status"}"#);
    }

    #[test]
    fn test_partial_failure_names_applied_step() {
        let err = aggregate_steps(
            "rx-1",
            Some(Ok(StepOutcome::ok("wifi ok"))),
            Some(Err(ProvisionError::new(ErrorKind::Unknown, "server rejected"))),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.message.contains("WiFi settings were applied"));
    }
}
