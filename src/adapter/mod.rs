// Vendor adapters
//
// One `VendorAdapter` per device family. Both variants expose the same
// capability set: scan, connect, configure, query, disconnect. They differ
// only in the SDK underneath.

pub mod blufi;
pub mod radar;
pub(crate) mod session;
pub mod sleepace;
pub mod sleepace_sdk;
#[cfg(test)]
pub(crate) mod test_support;

use crate::error::{ErrorKind, ProvisionError, ProvisionResult};
use crate::filter::DiscoveryFilter;
use crate::models::{ConfigureReport, ConfigureRequest, DeviceRecord, Vendor};
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Configuring,
    Querying,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Idle => "idle",
            AdapterState::Scanning => "scanning",
            AdapterState::Connecting => "connecting",
            AdapterState::Connected => "connected",
            AdapterState::Configuring => "configuring",
            AdapterState::Querying => "querying",
        };
        f.write_str(s)
    }
}

/// Which adapter serves a vendor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterFamily {
    Radar,
    Sleepace,
}

impl AdapterFamily {
    pub fn for_vendor(vendor: Vendor) -> Self {
        match vendor {
            Vendor::RadarQl | Vendor::EspBle => AdapterFamily::Radar,
            Vendor::SleepBoardHs => AdapterFamily::Sleepace,
        }
    }

    pub fn serves(&self, vendor: Vendor) -> bool {
        Self::for_vendor(vendor) == *self
    }
}

impl fmt::Display for AdapterFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterFamily::Radar => f.write_str("radar"),
            AdapterFamily::Sleepace => f.write_str("sleepace"),
        }
    }
}

/// Delivered through the completion callback when an operation succeeds.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    ScanFinished { family: AdapterFamily },
    Connected(DeviceRecord),
    Configured(ConfigureReport),
    StatusUpdated(DeviceRecord),
    Disconnected { device_id: String },
}

pub type ErrorCallback = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

// ============================================================================
// Scan stream
// ============================================================================

/// Live discovery results. Ends when the scan stops or times out; dropping it
/// stops the scan.
pub struct ScanStream {
    inner: UnboundedReceiverStream<DeviceRecord>,
    on_end: Vec<Box<dyn FnOnce() + Send>>,
}

impl ScanStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<DeviceRecord>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            on_end: Vec::new(),
        }
    }

    /// Run `f` once when the stream ends or is dropped, whichever is first.
    pub(crate) fn on_end(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_end.push(Box::new(f));
        self
    }

    fn fire_end(&mut self) {
        for f in self.on_end.drain(..) {
            f();
        }
    }
}

impl fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanStream")
            .field("end_hooks", &self.on_end.len())
            .finish_non_exhaustive()
    }
}

impl Stream for ScanStream {
    type Item = DeviceRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DeviceRecord>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.fire_end();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.fire_end();
    }
}

// ============================================================================
// Adapter trait
// ============================================================================

#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn family(&self) -> AdapterFamily;

    /// Whether `start_scan` honours a `DiscoveryFilter`.
    fn supports_filtering(&self) -> bool;

    fn state(&self) -> AdapterState;

    /// Device the current session is attached to, if any.
    fn current_device(&self) -> Option<String>;

    /// Start discovery. `None` or a zero timeout uses the configured default.
    async fn start_scan(
        &self,
        timeout: Option<Duration>,
        filter: Option<DiscoveryFilter>,
    ) -> ProvisionResult<ScanStream>;

    async fn stop_scan(&self);

    async fn connect(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord>;

    async fn configure(
        &self,
        device: &DeviceRecord,
        request: &ConfigureRequest,
    ) -> ProvisionResult<ConfigureReport>;

    async fn query_status(&self, device: &DeviceRecord) -> ProvisionResult<DeviceRecord>;

    /// Tear down the session. Pending operations resolve with `Cancelled`.
    async fn disconnect(&self);

    fn set_error_callback(&self, callback: ErrorCallback);

    fn set_completion_callback(&self, callback: CompletionCallback);

    /// Report an error raised outside the adapter (e.g. by the orchestrator)
    /// through this adapter's error callback.
    fn notify_error(&self, error: &ProvisionError);
}

/// Reject records that belong to the other adapter family.
pub(crate) fn check_family(family: AdapterFamily, device: &DeviceRecord) -> ProvisionResult<()> {
    if family.serves(device.vendor()) {
        Ok(())
    } else {
        Err(ProvisionError::invalid(format!(
            "{} is a {} device and cannot be handled by the {family} adapter",
            device.device_id(),
            device.vendor()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_static_vendor_mapping() {
        assert_eq!(AdapterFamily::for_vendor(Vendor::RadarQl), AdapterFamily::Radar);
        assert_eq!(AdapterFamily::for_vendor(Vendor::EspBle), AdapterFamily::Radar);
        assert_eq!(AdapterFamily::for_vendor(Vendor::SleepBoardHs), AdapterFamily::Sleepace);
    }

    #[tokio::test]
    async fn test_scan_stream_end_hook_runs_once() {
        let ended = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = ended.clone();
        let mut stream = ScanStream::new(rx).on_end(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(tx);
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scan_stream_drop_runs_hook() {
        let ended = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel::<DeviceRecord>();
        let counter = ended.clone();
        let stream = ScanStream::new(rx).on_end(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(stream);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }
}
