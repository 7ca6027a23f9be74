// Sleepace adapter
//
// Serves SleepBoardHs devices through the Sleepace SDK. The SDK owns the
// scan, so discovery filters cannot be applied and every device is reported.

use super::session::{self, CancelSignal, ConnectPlan, SessionCore};
use super::sleepace_sdk::{
    SleepaceAck, SleepaceClient, SleepaceConfigFrame, SleepaceFault, SleepacePeripheral,
    SleepaceStatus, SleepaceWifiStatus,
};
use super::{
    check_family, AdapterFamily, AdapterState, CompletionCallback, ErrorCallback, ScanStream,
    SessionEvent, VendorAdapter,
};
use crate::config::Timeouts;
use crate::error::{ErrorKind, ProvisionError, ProvisionResult};
use crate::filter::{effective_timeout, DiscoveryFilter};
use crate::models::{
    ConfigureReport, ConfigureRequest, DeviceRecord, ServerState, SignalStrength, StepOutcome,
    ValidatedConfig, Vendor, WifiMode, WifiState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type PeripheralCache = Arc<Mutex<HashMap<String, SleepacePeripheral>>>;

fn record_from_peripheral(p: &SleepacePeripheral) -> DeviceRecord {
    let mut record = DeviceRecord::discovered(
        Vendor::SleepBoardHs,
        p.peripheral_id.clone(),
        p.name.clone(),
        SignalStrength::from_reading(p.rssi),
    );
    record.mac_address = p.mac_address.clone();
    record.uid = p.device_code.clone();
    record
}

fn frame_for(config: &ValidatedConfig) -> SleepaceConfigFrame {
    let mut frame = SleepaceConfigFrame::default();
    if let Some(wifi) = &config.wifi {
        frame.wifi_ssid = Some(wifi.ssid.clone());
        frame.wifi_password = wifi.password.clone();
    }
    if let Some(server) = &config.server {
        frame.server_address = Some(server.address.clone());
        frame.server_port = server.port;
        frame.server_protocol = Some(server.protocol);
    }
    frame
}

fn states_from_status(status: SleepaceWifiStatus) -> (WifiState, Option<ServerState>) {
    let wifi = WifiState {
        ssid: status.ssid.filter(|s| !s.is_empty()),
        connected: status.connected,
        // Sleep boards only run as WiFi stations
        mode: Some(WifiMode::Station),
        signal: SignalStrength::from_reading(status.rssi),
        mac_address: status.mac_address,
    };
    let server = status.server_address.filter(|a| !a.is_empty()).map(|address| ServerState {
        address: Some(address),
        port: status.server_port.filter(|p| *p != 0),
        protocol: status.server_protocol,
        connected: status.server_connected,
    });
    (wifi, server)
}

pub struct SleepaceAdapter {
    client: Arc<dyn SleepaceClient>,
    timeouts: Timeouts,
    core: Arc<SessionCore>,
    seen: PeripheralCache,
}

impl SleepaceAdapter {
    pub fn new(client: Arc<dyn SleepaceClient>, timeouts: Timeouts) -> Self {
        Self {
            client,
            timeouts,
            core: Arc::new(SessionCore::new("sleepace")),
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn ensure_radio(&self) -> ProvisionResult<()> {
        if self.client.bluetooth_enabled().await {
            Ok(())
        } else {
            Err(ProvisionError::bluetooth_disabled())
        }
    }

    fn lookup(&self, device_id: &str) -> Option<SleepacePeripheral> {
        self.seen.lock().ok().and_then(|m| m.get(device_id).cloned())
    }

    async fn open_scan(
        &self,
        timeout: Option<Duration>,
        filter: Option<DiscoveryFilter>,
    ) -> ProvisionResult<ScanStream> {
        self.ensure_radio().await?;
        if let Some(f) = &filter {
            tlog!(
                "[sleepace] The Sleepace SDK cannot filter; ignoring {:?} \"{}\" and reporting every device",
                f.filter_type,
                f.value
            );
        }
        let (generation, stop_rx) = self.core.begin_scan()?;
        // Only the latest scan's sightings can be connected to
        if let Ok(mut cache) = self.seen.lock() {
            cache.clear();
        }
        let found = match self.client.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                self.core.finish_scan(generation);
                return Err(e.into());
            }
        };

        let window = effective_timeout(timeout, self.timeouts.scan);
        tlog!("[sleepace] Scan started for {window:?}");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_scan(
            self.core.clone(),
            self.client.clone(),
            self.seen.clone(),
            found,
            window,
            stop_rx,
            tx,
            generation,
        ));

        let core = self.core.clone();
        Ok(ScanStream::new(rx).on_end(move || core.stop_scan_generation(generation)))
    }

    async fn establish(&self, device: &DeviceRecord, cancel: &CancelSignal) -> ProvisionResult<DeviceRecord> {
        let id = device.device_id();
        let peripheral = self.lookup(id).ok_or_else(|| {
            ProvisionError::not_found(format!(
                "{id} has not been seen by a Sleepace scan. Scan again and make sure it is in range."
            ))
        })?;

        tlog!("[sleepace] Connecting to {id}...");
        session::guarded(
            cancel,
            self.timeouts.connect,
            || ProvisionError::new(ErrorKind::ConnectionTimeout, format!("Connecting to {id} timed out")),
            self.open_link(&peripheral),
        )
        .await?;
        tlog!("[sleepace] Connected to {id}");

        let mut record = device.clone();
        if record.uid.is_none() {
            record.uid = peripheral.device_code.clone();
        }
        record.last_update = Some(chrono::Utc::now());
        Ok(record)
    }

    async fn open_link(&self, peripheral: &SleepacePeripheral) -> ProvisionResult<()> {
        Ok(self.client.connect(peripheral).await?)
    }

    async fn handshake(&self) -> ProvisionResult<()> {
        Ok(self.client.handshake().await?)
    }

    async fn frame_exchange(&self, frame: &SleepaceConfigFrame) -> ProvisionResult<SleepaceAck> {
        self.client.send_config_frame(frame).await?;
        Ok(self.client.await_ack().await?)
    }

    async fn status_exchange(&self) -> ProvisionResult<SleepaceWifiStatus> {
        Ok(self.client.query_wifi_status().await?)
    }

    async fn run_configure(
        &self,
        device_id: &str,
        config: &ValidatedConfig,
        cancel: &CancelSignal,
    ) -> ProvisionResult<ConfigureReport> {
        tlog!("[sleepace] Handshaking with {device_id}");
        session::guarded(
            cancel,
            self.timeouts.negotiate,
            || {
                ProvisionError::new(
                    ErrorKind::SecurityNegotiationFailed,
                    format!("Session handshake with {device_id} timed out"),
                )
            },
            self.handshake(),
        )
        .await?;

        let frame = frame_for(config);
        tlog!(
            "[sleepace] Sending config frame (wifi={:?}, server={:?}:{})",
            frame.wifi_ssid,
            frame.server_address,
            frame.server_port
        );
        let ack = session::guarded(
            cancel,
            self.timeouts.ack,
            || {
                ProvisionError::new(
                    ErrorKind::DataTransmissionError,
                    "The sleep board did not acknowledge the configuration",
                )
            },
            self.frame_exchange(&frame),
        )
        .await?;

        if ack.status != SleepaceStatus::Succeed {
            let err: ProvisionError = SleepaceFault::from(ack.status).into();
            return Err(match ack.message {
                Some(detail) => ProvisionError::new(err.kind, format!("{}: {detail}", err.message)),
                None => err,
            });
        }

        // Both groups ride in one frame, so they succeed or fail together
        let wifi = config
            .wifi
            .as_ref()
            .map(|w| StepOutcome::ok(format!("WiFi credentials for \"{}\" accepted", w.ssid)));
        let server = config.server.as_ref().map(|s| {
            StepOutcome::ok(format!("Server set to {}:{} ({})", s.address, s.port, s.protocol))
        });
        Ok(ConfigureReport::from_steps(device_id, wifi, server))
    }

    async fn run_query(&self, device: &DeviceRecord, cancel: &CancelSignal) -> ProvisionResult<DeviceRecord> {
        let status = session::read_with_retry(
            cancel,
            self.timeouts.query,
            self.timeouts.query_retries,
            "WiFi status",
            || self.status_exchange(),
        )
        .await?;
        let firmware = status.firmware_version.clone();
        let (wifi, server) = states_from_status(status);
        tlog!(
            "[sleepace] Status of {}: ssid={:?} connected={}",
            device.device_id(),
            wifi.ssid,
            wifi.connected
        );
        let mut record = device.refreshed(Some(wifi), server);
        if firmware.is_some() {
            record.version = firmware;
        }
        Ok(record)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    core: Arc<SessionCore>,
    client: Arc<dyn SleepaceClient>,
    seen: PeripheralCache,
    mut found: mpsc::UnboundedReceiver<SleepacePeripheral>,
    window: Duration,
    mut stop: watch::Receiver<bool>,
    tx: mpsc::UnboundedSender<DeviceRecord>,
    generation: u64,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tlog!("[sleepace] Scan window elapsed");
                break;
            }
            _ = stop.wait_for(|s| *s) => {
                tlog!("[sleepace] Scan stopped");
                break;
            }
            peripheral = found.recv() => match peripheral {
                Some(p) => {
                    let record = record_from_peripheral(&p);
                    if let Ok(mut cache) = seen.lock() {
                        cache.insert(p.peripheral_id.clone(), p);
                    }
                    if tx.send(record).is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    client.stop_scan().await;
    core.finish_scan(generation);
    tlog!("[sleepace] Scan finished");
    core.emit(&SessionEvent::ScanFinished {
        family: AdapterFamily::Sleepace,
    });
}

#[async_trait]
impl VendorAdapter for SleepaceAdapter {
    fn family(&self) -> AdapterFamily {
        AdapterFamily::Sleepace
    }

    fn supports_filtering(&self) -> bool {
        false
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
        let plan = match check_family(AdapterFamily::Sleepace, device) {
            Ok(()) => match self.ensure_radio().await {
                Ok(()) => self.core.prepare_connect(device.device_id()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (ticket, previous) = match plan {
            Ok(ConnectPlan::AlreadyConnected) => {
                tlog!("[sleepace] Already connected to {}", device.device_id());
                return Ok(device.clone());
            }
            Ok(ConnectPlan::Proceed { ticket, previous }) => (ticket, previous),
            Err(e) => {
                self.core.emit_error(&e);
                return Err(e);
            }
        };

        if let Some(previous) = previous {
            tlog!("[sleepace] Dropping {previous} before connecting to {}", device.device_id());
            self.client.disconnect().await;
            self.core.emit(&SessionEvent::Disconnected { device_id: previous });
        }

        let result = self.establish(device, &ticket.cancel).await;
        if result.is_err() && self.core.is_current(ticket.generation) {
            self.client.disconnect().await;
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
            self.client.disconnect().await;
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
            self.client.disconnect().await;
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
            tlog!("[sleepace] Disconnecting from {device_id}");
            self.client.disconnect().await;
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
