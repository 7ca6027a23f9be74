// BluFi SDK binding contract
//
// The radar adapter drives the Espressif BluFi client through this trait.
// Key exchange, frame encryption and sequencing live inside the binding;
// the adapter only sees requests, acknowledgements and status codes.

use async_trait::async_trait;
use thiserror::Error;

// BluFi client status codes (ESP BluFi SDK).
pub const CODE_SUCCESS: i32 = 0;
pub const CODE_INVALID_NOTIFICATION: i32 = -1000;
pub const CODE_CATCH_EXCEPTION: i32 = -1001;
pub const CODE_WRITE_DATA_FAILED: i32 = -1002;
pub const CODE_INVALID_DATA: i32 = -1003;
pub const CODE_NEG_POST_FAILED: i32 = -2000;
pub const CODE_NEG_ERR_DEV_KEY: i32 = -2001;
pub const CODE_NEG_ERR_SECURITY: i32 = -2002;
pub const CODE_NEG_ERR_SET_SECURITY: i32 = -2003;
pub const CODE_CONF_INVALID_OPMODE: i32 = -3000;
pub const CODE_CONF_ERR_SET_OPMODE: i32 = -3001;
pub const CODE_CONF_ERR_POST_STA: i32 = -3002;
pub const CODE_CONF_ERR_POST_SOFTAP: i32 = -3003;
pub const CODE_GATT_WRITE_TIMEOUT: i32 = -4000;
pub const CODE_WIFI_SCAN_FAIL: i32 = 11;

// Link-level codes reported by the binding itself.
pub const CODE_CONNECT_FAILED: i32 = -5000;
pub const CODE_DISCONNECTED: i32 = -5001;
pub const CODE_PERIPHERAL_NOT_FOUND: i32 = -5002;
pub const CODE_BLUETOOTH_OFF: i32 = -5003;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("BluFi error {code}: {message}")]
pub struct BlufiFault {
    pub code: i32,
    pub message: String,
}

impl BlufiFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BlufiOpMode {
    #[default]
    Null,
    Sta,
    SoftAp,
    StaSoftAp,
}

/// Station parameters posted by `post_configure`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlufiStationParams {
    pub op_mode: BlufiOpMode,
    pub sta_ssid: String,
    pub sta_password: Option<String>,
}

/// Reply to `request_device_status`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlufiStatus {
    pub op_mode: BlufiOpMode,
    pub sta_connected: bool,
    pub sta_ssid: Option<String>,
    pub sta_bssid: Option<String>,
    pub softap_connection_count: u8,
}

/// Notifications delivered by the binding, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlufiEvent {
    /// Device acknowledged a `post_configure`; `status` is a BluFi code.
    PostConfigureParams { status: i32 },
    DeviceStatus(BlufiStatus),
    DeviceVersion(String),
    CustomData(Vec<u8>),
    /// Asynchronous error report from the device.
    Error { code: i32 },
}

#[async_trait]
pub trait BlufiClient: Send + Sync {
    /// Open the GATT link to a peripheral and enable notifications.
    async fn open(&self, peripheral_id: &str) -> Result<(), BlufiFault>;

    /// Run the key exchange. Frames sent afterwards are encrypted.
    async fn negotiate_security(&self) -> Result<(), BlufiFault>;

    /// Send station credentials. The acknowledgement arrives as
    /// `BlufiEvent::PostConfigureParams`.
    async fn post_configure(&self, params: &BlufiStationParams) -> Result<(), BlufiFault>;

    /// Send an application payload. Replies arrive as `BlufiEvent::CustomData`.
    async fn post_custom_data(&self, data: &[u8]) -> Result<(), BlufiFault>;

    async fn request_device_status(&self) -> Result<(), BlufiFault>;

    async fn request_device_version(&self) -> Result<(), BlufiFault>;

    /// Next notification from the device. Cancel-safe.
    async fn next_event(&self) -> Result<BlufiEvent, BlufiFault>;

    /// Drop notifications that are queued but not yet read. Called before
    /// each request so a late reply to an earlier one is not mistaken for
    /// the answer to the new one.
    async fn discard_pending(&self);

    /// Close the link. Idempotent.
    async fn close(&self);
}
