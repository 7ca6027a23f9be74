// Session orchestrator
//
// Routes each device to the adapter for its vendor and allows one scan,
// configure or query in flight per adapter. Adapters are built by the caller
// and live as long as the orchestrator.

use crate::adapter::{
    AdapterFamily, AdapterState, CompletionCallback, ErrorCallback, ScanStream, VendorAdapter,
};
use crate::error::{ProvisionError, ProvisionResult};
use crate::filter::DiscoveryFilter;
use crate::models::{ConfigureReport, ConfigureRequest, DeviceRecord};
use crate::storage::ConfigStorage;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Operation gate
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GateOp {
    Scan,
    Configure,
    Query,
}

impl fmt::Display for GateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateOp::Scan => f.write_str("scan"),
            GateOp::Configure => f.write_str("configure"),
            GateOp::Query => f.write_str("status query"),
        }
    }
}

#[derive(Default)]
struct GateSlot {
    next_token: u64,
    held: Option<(u64, GateOp)>,
}

/// One in-flight operation per adapter.
#[derive(Default)]
struct OperationGate {
    slot: Mutex<GateSlot>,
}

struct GateGuard {
    gate: Arc<OperationGate>,
    token: u64,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.gate.slot.lock() {
            if slot.held.map(|(t, _)| t) == Some(self.token) {
                slot.held = None;
            }
        }
    }
}

impl OperationGate {
    /// Take the slot for `op`. A scan slot whose scan has already ended
    /// (stream not yet drained or dropped) can be taken over.
    fn try_acquire(self: &Arc<Self>, op: GateOp, scan_over: bool) -> Result<GateGuard, GateOp> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.held {
            Some((_, GateOp::Scan)) if scan_over => {}
            Some((_, current)) => return Err(current),
            None => {}
        }
        slot.next_token += 1;
        let token = slot.next_token;
        slot.held = Some((token, op));
        Ok(GateGuard {
            gate: self.clone(),
            token,
        })
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Lane {
    adapter: Arc<dyn VendorAdapter>,
    gate: Arc<OperationGate>,
}

impl Lane {
    fn new(adapter: Arc<dyn VendorAdapter>) -> Self {
        Self {
            adapter,
            gate: Arc::new(OperationGate::default()),
        }
    }

    fn acquire(&self, op: GateOp) -> ProvisionResult<GateGuard> {
        let scan_over = self.adapter.state() != AdapterState::Scanning;
        self.gate.try_acquire(op, scan_over).map_err(|current| {
            let err = ProvisionError::busy(format!(
                "Cannot start a {op} while a {current} is in progress on the {} adapter",
                self.adapter.family()
            ));
            self.adapter.notify_error(&err);
            err
        })
    }
}

pub struct Orchestrator {
    radar: Lane,
    sleepace: Lane,
    storage: Option<Arc<ConfigStorage>>,
}

impl Orchestrator {
    pub fn new(radar: Arc<dyn VendorAdapter>, sleepace: Arc<dyn VendorAdapter>) -> ProvisionResult<Self> {
        for (adapter, expected) in [(&radar, AdapterFamily::Radar), (&sleepace, AdapterFamily::Sleepace)] {
            if adapter.family() != expected {
                return Err(ProvisionError::invalid(format!(
                    "Expected a {expected} adapter, got a {} adapter",
                    adapter.family()
                )));
            }
        }
        Ok(Self {
            radar: Lane::new(radar),
            sleepace: Lane::new(sleepace),
            storage: None,
        })
    }

    /// Record successful configurations in the history store.
    pub fn with_storage(mut self, storage: Arc<ConfigStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    fn lane(&self, family: AdapterFamily) -> &Lane {
        match family {
            AdapterFamily::Radar => &self.radar,
            AdapterFamily::Sleepace => &self.sleepace,
        }
    }

    fn lane_for(&self, device: &DeviceRecord) -> &Lane {
        self.lane(AdapterFamily::for_vendor(device.vendor()))
    }

    pub fn adapter(&self, family: AdapterFamily) -> Arc<dyn VendorAdapter> {
        self.lane(family).adapter.clone()
    }

    pub fn state(&self, family: AdapterFamily) -> AdapterState {
        self.lane(family).adapter.state()
    }

    /// Install the same callbacks on both adapters.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.radar.adapter.set_error_callback(callback.clone());
        self.sleepace.adapter.set_error_callback(callback);
    }

    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        self.radar.adapter.set_completion_callback(callback.clone());
        self.sleepace.adapter.set_completion_callback(callback);
    }

    pub async fn start_scan(
        &self,
        family: AdapterFamily,
        timeout: Option<Duration>,
        filter: Option<DiscoveryFilter>,
    ) -> ProvisionResult<ScanStream> {
        let lane = self.lane(family);
        let guard = lane.acquire(GateOp::Scan)?;
        let stream = lane.adapter.start_scan(timeout, filter).await?;
        Ok(stream.on_end(move || drop(guard)))
    }

    pub async fn stop_scan(&self, family: AdapterFamily) {
        self.lane(family).adapter.stop_scan().await;
    }

    pub async fn connect(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord> {
        self.lane_for(device).adapter.connect(device).await
    }

    pub async fn configure(
        &self,
        device: &DeviceRecord,
        request: &ConfigureRequest,
    ) -> ProvisionResult<ConfigureReport> {
        let lane = self.lane_for(device);
        let _guard = lane.acquire(GateOp::Configure)?;
        let report = lane.adapter.configure(device, request).await?;
        self.remember(request);
        Ok(report)
    }

    pub async fn query_status(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord> {
        let lane = self.lane_for(device);
        let _guard = lane.acquire(GateOp::Query)?;
        lane.adapter.query_status(device).await
    }

    pub async fn disconnect(&self, family: AdapterFamily) {
        self.lane(family).adapter.disconnect().await;
    }

    pub async fn disconnect_all(&self) {
        self.radar.adapter.disconnect().await;
        self.sleepace.adapter.disconnect().await;
    }

    fn remember(&self, request: &ConfigureRequest) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Some(ssid) = &request.wifi_ssid {
            if let Err(e) = storage.save_wifi_config(ssid, request.wifi_password.as_deref()) {
                tlog!("[orchestrator] Failed to save WiFi history: {e}");
            }
        }
        if let Some(address) = &request.server_address {
            let port = u16::try_from(request.server_port).unwrap_or(0);
            if let Err(e) = storage.save_server_config(address, port, request.server_protocol) {
                tlog!("[orchestrator] Failed to save server history: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::radar::RadarAdapter;
    use crate::adapter::sleepace::SleepaceAdapter;
    use crate::adapter::test_support::Recorder;
    use crate::config::Timeouts;
    use crate::error::ErrorKind;
    use crate::models::{SignalStrength, Vendor};
    use crate::sim::{SimBlufiClient, SimCentral, SimSleepaceClient};
    use futures::StreamExt;

    struct Bench {
        blufi: Arc<SimBlufiClient>,
        orchestrator: Orchestrator,
        radar_events: Arc<Recorder>,
    }

    fn bench() -> Bench {
        let central = Arc::new(SimCentral::new());
        let blufi = Arc::new(SimBlufiClient::new());
        central.advertise("rx-1", Some("RX-1"), -45);
        blufi.add_radar("rx-1", "1.4.2", "AA:BB:CC:00:00:01");
        let sleepace_client = Arc::new(SimSleepaceClient::new());
        sleepace_client.add_board("sb-1", "Z4-0001", -50);

        let radar = Arc::new(RadarAdapter::new(central, blufi.clone(), Timeouts::default()));
        let radar_events = Recorder::attach(radar.as_ref());
        let sleepace = Arc::new(SleepaceAdapter::new(sleepace_client, Timeouts::default()));
        let orchestrator = Orchestrator::new(radar, sleepace).unwrap();
        Bench {
            blufi,
            orchestrator,
            radar_events,
        }
    }

    fn radar_record() -> DeviceRecord {
        DeviceRecord::discovered(Vendor::RadarQl, "rx-1", "RX-1", SignalStrength::UNAVAILABLE)
    }

    #[test]
    fn test_gate_allows_one_operation() {
        let gate = Arc::new(OperationGate::default());
        let guard = gate.try_acquire(GateOp::Configure, true).unwrap();
        assert_eq!(gate.try_acquire(GateOp::Query, true).err(), Some(GateOp::Configure));
        drop(guard);
        assert!(gate.try_acquire(GateOp::Query, true).is_ok());
    }

    #[test]
    fn test_finished_scan_slot_can_be_taken_over() {
        let gate = Arc::new(OperationGate::default());
        let scan = gate.try_acquire(GateOp::Scan, false).unwrap();
        assert_eq!(gate.try_acquire(GateOp::Configure, false).err(), Some(GateOp::Scan));

        let configure = gate.try_acquire(GateOp::Configure, true).unwrap();
        // The stale scan guard must not release the configure slot
        drop(scan);
        assert_eq!(gate.try_acquire(GateOp::Query, true).err(), Some(GateOp::Configure));
        drop(configure);
    }

    #[test]
    fn test_rejects_swapped_adapters() {
        let central = Arc::new(SimCentral::new());
        let radar: Arc<dyn VendorAdapter> =
            Arc::new(RadarAdapter::new(central, Arc::new(SimBlufiClient::new()), Timeouts::default()));
        let err = Orchestrator::new(radar.clone(), radar).err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_busy_while_scanning() {
        let b = bench();
        let stream = b
            .orchestrator
            .start_scan(AdapterFamily::Radar, None, None)
            .await
            .unwrap();

        let err = b
            .orchestrator
            .configure(&radar_record(), &ConfigureRequest::wifi("Home", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Busy);
        assert_eq!(b.radar_events.error_kinds(), vec![ErrorKind::Busy]);
        assert_eq!(b.blufi.wire_writes(), 0);

        // The other family is independent
        let boards: Vec<DeviceRecord> = b
            .orchestrator
            .start_scan(AdapterFamily::Sleepace, Some(Duration::from_secs(1)), None)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(boards.len(), 1);

        // Draining the radar scan frees the slot
        let radars: Vec<DeviceRecord> = stream.collect().await;
        assert_eq!(radars.len(), 1);
        let err = b
            .orchestrator
            .query_status(&radar_record())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeviceNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_busy_during_configure() {
        let b = bench();
        let device = b.orchestrator.connect(&radar_record()).await.unwrap();
        b.blufi.set_negotiation_hangs(true);

        let request = ConfigureRequest::wifi("Home", None);
        let (configured, queried) = tokio::join!(b.orchestrator.configure(&device, &request), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            b.orchestrator.query_status(&device).await
        });
        assert_eq!(queried.unwrap_err().kind, ErrorKind::Busy);
        assert_eq!(configured.unwrap_err().kind, ErrorKind::SecurityNegotiationFailed);

        b.blufi.set_negotiation_hangs(false);
        assert!(b.orchestrator.query_status(&device).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_by_vendor_and_records_history() {
        let dir = std::env::temp_dir().join(format!("wisefido-orch-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let storage = Arc::new(ConfigStorage::open(dir.join("storage.json")).unwrap());
        let b = bench();
        let orchestrator = b.orchestrator.with_storage(storage.clone());

        let device = orchestrator.connect(&radar_record()).await.unwrap();
        assert_eq!(orchestrator.state(AdapterFamily::Radar), AdapterState::Connected);
        assert_eq!(orchestrator.state(AdapterFamily::Sleepace), AdapterState::Idle);

        let request = ConfigureRequest::wifi("Home", Some("pw")).with_server("10.0.0.5", 9100, None);
        orchestrator.configure(&device, &request).await.unwrap();
        assert_eq!(storage.wifi_configs()[0].ssid, "Home");
        assert_eq!(storage.server_configs()[0].port, 9100);

        orchestrator.disconnect_all().await;
        assert_eq!(orchestrator.state(AdapterFamily::Radar), AdapterState::Idle);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
