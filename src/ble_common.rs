// Shared platform BLE access
//
// The `BleCentral` trait is the seam between the adapters and the platform
// Bluetooth stack: radio state, discovery and peripheral lookup. The radar
// adapter discovers through it; `BtleplugCentral` implements it on btleplug.

use crate::error::{ProvisionError, ProvisionResult};
use async_trait::async_trait;
use btleplug::api::{Central, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// How often the btleplug central re-reads its peripheral list while scanning.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Types
// ============================================================================

/// One advertisement as seen by the platform stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral id (UUID on Apple platforms, MAC elsewhere).
    pub peripheral_id: String,
    pub local_name: Option<String>,
    /// Bluetooth address, when the platform exposes it.
    pub address: Option<String>,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Platform Bluetooth central used by adapters for discovery.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Whether the radio is powered on.
    async fn radio_powered(&self) -> ProvisionResult<bool>;

    /// Start discovery. Every sighting (including repeats) is sent on the
    /// returned channel until `stop_discovery` is called.
    async fn start_discovery(&self) -> ProvisionResult<mpsc::UnboundedReceiver<Advertisement>>;

    /// Stop discovery. Safe to call when not scanning.
    async fn stop_discovery(&self) -> ProvisionResult<()>;

    /// Whether the platform currently knows the peripheral (seen and in range).
    async fn is_known(&self, peripheral_id: &str) -> ProvisionResult<bool>;
}

// ============================================================================
// Helpers
// ============================================================================

/// Run discovery for a fixed window and return the latest sighting of each
/// peripheral, strongest signal first.
pub async fn collect_advertisements(
    central: &dyn BleCentral,
    window: Duration,
) -> ProvisionResult<Vec<Advertisement>> {
    if !central.radio_powered().await? {
        return Err(ProvisionError::bluetooth_disabled());
    }
    let mut rx = central.start_discovery().await?;
    let deadline = tokio::time::Instant::now() + window;
    let mut latest: HashMap<String, Advertisement> = HashMap::new();

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(adv)) => {
                latest.insert(adv.peripheral_id.clone(), adv);
            }
            Ok(None) | Err(_) => break,
        }
    }
    central.stop_discovery().await?;

    let mut found: Vec<Advertisement> = latest.into_values().collect();
    found.sort_by_key(|a| std::cmp::Reverse(a.rssi.unwrap_or(i16::MIN)));
    Ok(found)
}

// ============================================================================
// btleplug central
// ============================================================================

/// `BleCentral` backed by the first btleplug adapter on the host.
pub struct BtleplugCentral {
    _manager: Manager,
    adapter: Adapter,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugCentral {
    /// Initialise the BLE manager and pick the first adapter.
    pub async fn new() -> ProvisionResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProvisionError::new(
                    crate::error::ErrorKind::BluetoothDisabled,
                    "No Bluetooth adapter found on this machine",
                )
            })?;
        Ok(Self {
            _manager: manager,
            adapter,
            poller: Mutex::new(None),
        })
    }

    fn abort_poller(&self) {
        if let Ok(mut guard) = self.poller.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn radio_powered(&self) -> ProvisionResult<bool> {
        let state = self.adapter.adapter_state().await?;
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn start_discovery(&self) -> ProvisionResult<mpsc::UnboundedReceiver<Advertisement>> {
        self.abort_poller();

        // No service UUID filter: CoreBluetooth only matches UUIDs in the
        // primary advertisement packet, so filtering happens on our side.
        self.adapter.start_scan(ScanFilter::default()).await?;
        tlog!("[ble_common] Discovery started");

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;

                let peripherals = match adapter.peripherals().await {
                    Ok(p) => p,
                    Err(e) => {
                        tlog!("[ble_common] Failed to list peripherals: {e}");
                        break;
                    }
                };

                for peripheral in peripherals {
                    let props = match peripheral.properties().await.ok().flatten() {
                        Some(p) => p,
                        None => continue,
                    };
                    let address = props.address.to_string();
                    let adv = Advertisement {
                        peripheral_id: peripheral.id().to_string(),
                        local_name: props.local_name,
                        // CoreBluetooth hides the MAC and reports all zeros
                        address: (address != "00:00:00:00:00:00").then_some(address),
                        services: props.services,
                        rssi: props.rssi,
                    };
                    if tx.send(adv).is_err() {
                        return;
                    }
                }
            }
        });

        if let Ok(mut guard) = self.poller.lock() {
            *guard = Some(handle);
        }
        Ok(rx)
    }

    async fn stop_discovery(&self) -> ProvisionResult<()> {
        let was_running = self
            .poller
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false);
        self.abort_poller();
        if was_running {
            self.adapter.stop_scan().await?;
            tlog!("[ble_common] Discovery stopped");
        }
        Ok(())
    }

    async fn is_known(&self, peripheral_id: &str) -> ProvisionResult<bool> {
        let peripherals = self.adapter.peripherals().await?;
        Ok(peripherals
            .iter()
            .any(|p| p.id().to_string().eq_ignore_ascii_case(peripheral_id)))
    }
}
