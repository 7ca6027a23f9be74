// BLE provisioning core for WiseFido radar sensors and Sleepace sleep boards.
//
// Discovery, connection, WiFi/server configuration and status queries over
// Bluetooth LE, behind one adapter contract per device family.

#[macro_use]
pub mod logging;

pub mod adapter;
pub mod ble_common;
pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod sim;
pub mod storage;

pub use adapter::radar::RadarAdapter;
pub use adapter::sleepace::SleepaceAdapter;
pub use adapter::{
    AdapterFamily, AdapterState, CompletionCallback, ErrorCallback, ScanStream, SessionEvent,
    VendorAdapter,
};
pub use config::{ProvisionerConfig, Timeouts};
pub use error::{ErrorKind, ProvisionError, ProvisionResult};
pub use filter::{DiscoveryFilter, FilterType};
pub use models::{ConfigureReport, ConfigureRequest, DeviceRecord, ServerProtocol, Vendor};
pub use orchestrator::Orchestrator;
pub use storage::ConfigStorage;
