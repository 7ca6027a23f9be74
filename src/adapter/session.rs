// Session core shared by both adapters
//
// Owns the adapter state machine, the current target device, the per-
// operation cancellation signal and the registered callbacks. Nothing here
// is held across an await: every method takes the lock, updates, releases.

use super::{AdapterState, CompletionCallback, ErrorCallback, SessionEvent};
use crate::error::{ErrorKind, ProvisionError, ProvisionResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Cancellation
// ============================================================================

/// Resolves once the operation it belongs to is cancelled.
#[derive(Clone, Debug)]
pub(crate) struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub(crate) async fn cancelled(&self) {
        let mut rx = self.0.clone();
        // A dropped sender also counts: the owning operation was superseded.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug)]
pub(crate) struct OpTicket {
    pub generation: u64,
    pub cancel: CancelSignal,
}

pub(crate) enum ConnectPlan {
    AlreadyConnected,
    Proceed {
        ticket: OpTicket,
        /// Device whose link (or pending operation) was superseded.
        previous: Option<String>,
    },
}

fn cancelled_error() -> ProvisionError {
    ProvisionError::cancelled("The operation was cancelled because the device was disconnected")
}

/// Run one protocol step under the operation's cancel signal and a deadline.
pub(crate) async fn guarded<T, Fut>(
    cancel: &CancelSignal,
    limit: Duration,
    on_timeout: impl FnOnce() -> ProvisionError,
    step: Fut,
) -> ProvisionResult<T>
where
    Fut: Future<Output = ProvisionResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(cancelled_error()),
        res = tokio::time::timeout(limit, step) => match res {
            Ok(r) => r,
            Err(_) => Err(on_timeout()),
        },
    }
}

/// Like `guarded`, but a read that times out is retried up to `retries` times
/// before `DataTransmissionError` is surfaced.
pub(crate) async fn read_with_retry<T, F, Fut>(
    cancel: &CancelSignal,
    limit: Duration,
    retries: u8,
    what: &str,
    mut exchange: F,
) -> ProvisionResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProvisionResult<T>>,
{
    let mut attempt: u8 = 0;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled_error()),
            res = tokio::time::timeout(limit, exchange()) => match res {
                Ok(r) => return r,
                Err(_) if attempt < retries => {
                    attempt += 1;
                    tlog!("[session] {what} read timed out, retrying ({attempt}/{retries})");
                }
                Err(_) => {
                    return Err(ProvisionError::new(
                        ErrorKind::DataTransmissionError,
                        format!("The device did not answer the {what} request"),
                    ));
                }
            },
        }
    }
}

/// State to return to after a failed configure/query.
pub(crate) fn state_after_failure(err: &ProvisionError) -> AdapterState {
    if err.kind.is_fatal() {
        AdapterState::Idle
    } else {
        AdapterState::Connected
    }
}

// ============================================================================
// Session core
// ============================================================================

struct SessionInner {
    state: AdapterState,
    device_id: Option<String>,
    generation: u64,
    scan_stop: Option<watch::Sender<bool>>,
    op_cancel: Option<watch::Sender<bool>>,
}

pub(crate) struct SessionCore {
    label: &'static str,
    inner: Mutex<SessionInner>,
    on_error: Mutex<Option<ErrorCallback>>,
    on_complete: Mutex<Option<CompletionCallback>>,
}

impl SessionCore {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            inner: Mutex::new(SessionInner {
                state: AdapterState::Idle,
                device_id: None,
                generation: 0,
                scan_stop: None,
                op_cancel: None,
            }),
            on_error: Mutex::new(None),
            on_complete: Mutex::new(None),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut SessionInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub(crate) fn state(&self) -> AdapterState {
        self.with_inner(|s| s.state)
    }

    pub(crate) fn device_id(&self) -> Option<String> {
        self.with_inner(|s| s.device_id.clone())
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.with_inner(|s| s.generation == generation)
    }

    // ---- scan ---------------------------------------------------------------

    /// Enter `Scanning`. A scan is only started from `Idle`; anything else,
    /// including a second scan, is rejected with `Busy`.
    pub(crate) fn begin_scan(&self) -> ProvisionResult<(u64, watch::Receiver<bool>)> {
        let label = self.label;
        self.with_inner(|s| {
            match s.state {
                AdapterState::Idle => {}
                AdapterState::Scanning => {
                    return Err(ProvisionError::busy("A scan is already in progress"));
                }
                other => {
                    return Err(ProvisionError::busy(format!(
                        "Cannot scan while the {label} adapter is {other}"
                    )));
                }
            }
            let (tx, rx) = watch::channel(false);
            s.generation += 1;
            s.state = AdapterState::Scanning;
            s.scan_stop = Some(tx);
            Ok((s.generation, rx))
        })
    }

    /// Ask a running scan task to stop. Returns whether a scan was running.
    pub(crate) fn request_stop_scan(&self) -> bool {
        self.with_inner(|s| match s.scan_stop.take() {
            Some(tx) => {
                let _ = tx.send(true);
                true
            }
            None => false,
        })
    }

    /// Stop the scan started as `generation`, if it is still the running one.
    /// Used when a scan stream is dropped so a newer scan is left alone.
    pub(crate) fn stop_scan_generation(&self, generation: u64) {
        self.with_inner(|s| {
            if s.generation == generation {
                if let Some(tx) = s.scan_stop.take() {
                    let _ = tx.send(true);
                }
            }
        })
    }

    /// Called by the scan task when it exits. Leaves `Scanning` unless a
    /// connect has already taken over.
    pub(crate) fn finish_scan(&self, generation: u64) {
        self.with_inner(|s| {
            if s.generation == generation && s.state == AdapterState::Scanning {
                s.state = AdapterState::Idle;
                s.scan_stop = None;
            }
        })
    }

    // ---- connect ------------------------------------------------------------

    pub(crate) fn prepare_connect(&self, device_id: &str) -> ProvisionResult<ConnectPlan> {
        self.with_inner(|s| {
            let same_device = s.device_id.as_deref() == Some(device_id);
            let previous = match s.state {
                AdapterState::Connected if same_device => return Ok(ConnectPlan::AlreadyConnected),
                AdapterState::Connecting | AdapterState::Configuring | AdapterState::Querying
                    if same_device =>
                {
                    return Err(ProvisionError::busy(format!(
                        "{device_id} is already {}",
                        s.state
                    )));
                }
                AdapterState::Scanning => {
                    if let Some(tx) = s.scan_stop.take() {
                        let _ = tx.send(true);
                    }
                    None
                }
                AdapterState::Idle => None,
                // Connected, or mid-operation, on a different device
                _ => {
                    if let Some(tx) = s.op_cancel.take() {
                        let _ = tx.send(true);
                    }
                    s.device_id.take()
                }
            };

            let (tx, rx) = watch::channel(false);
            s.generation += 1;
            s.state = AdapterState::Connecting;
            s.device_id = Some(device_id.to_string());
            s.op_cancel = Some(tx);
            Ok(ConnectPlan::Proceed {
                ticket: OpTicket {
                    generation: s.generation,
                    cancel: CancelSignal(rx),
                },
                previous,
            })
        })
    }

    // ---- configure / query --------------------------------------------------

    /// Enter `Configuring` or `Querying`. Only allowed from `Connected` on
    /// the same device.
    pub(crate) fn begin_op(&self, next: AdapterState, device_id: &str) -> ProvisionResult<OpTicket> {
        self.with_inner(|s| {
            let same_device = s.device_id.as_deref() == Some(device_id);
            match s.state {
                AdapterState::Connected if same_device => {}
                AdapterState::Connecting | AdapterState::Configuring | AdapterState::Querying
                    if same_device =>
                {
                    return Err(ProvisionError::busy(format!(
                        "{device_id} is busy ({})",
                        s.state
                    )));
                }
                _ => {
                    return Err(ProvisionError::not_found(format!(
                        "Not connected to {device_id}. Connect to the device first."
                    )));
                }
            }
            let (tx, rx) = watch::channel(false);
            s.generation += 1;
            s.state = next;
            s.op_cancel = Some(tx);
            Ok(OpTicket {
                generation: s.generation,
                cancel: CancelSignal(rx),
            })
        })
    }

    /// Move to `next` if the operation identified by `generation` is still
    /// the current one. Returns false for superseded or cancelled operations.
    pub(crate) fn complete(&self, generation: u64, next: AdapterState) -> bool {
        self.with_inner(|s| {
            if s.generation != generation {
                return false;
            }
            s.state = next;
            s.op_cancel = None;
            if next == AdapterState::Idle {
                s.device_id = None;
            }
            true
        })
    }

    /// Drop the session: cancel any pending operation and return to `Idle`.
    /// Returns the device that was attached, if any. Scans are left alone.
    pub(crate) fn disconnect(&self) -> Option<String> {
        self.with_inner(|s| {
            if matches!(s.state, AdapterState::Idle | AdapterState::Scanning) {
                return None;
            }
            if let Some(tx) = s.op_cancel.take() {
                let _ = tx.send(true);
            }
            s.generation += 1;
            s.state = AdapterState::Idle;
            s.device_id.take()
        })
    }

    // ---- callbacks ----------------------------------------------------------

    pub(crate) fn set_error_callback(&self, callback: ErrorCallback) {
        if let Ok(mut slot) = self.on_error.lock() {
            *slot = Some(callback);
        }
    }

    pub(crate) fn set_completion_callback(&self, callback: CompletionCallback) {
        if let Ok(mut slot) = self.on_complete.lock() {
            *slot = Some(callback);
        }
    }

    pub(crate) fn emit_error(&self, err: &ProvisionError) {
        tlog!("[{}] {} error: {}", self.label, err.kind, err.message);
        let callback = self.on_error.lock().ok().and_then(|slot| slot.clone());
        if let Some(cb) = callback {
            cb(err.kind, &err.message);
        }
    }

    pub(crate) fn emit(&self, event: &SessionEvent) {
        let callback = self.on_complete.lock().ok().and_then(|slot| slot.clone());
        if let Some(cb) = callback {
            cb(event);
        }
    }

    /// Report a finished operation exactly once: the completion callback on
    /// success, the error callback on failure, never both. On failure the
    /// error is surfaced before the state moves.
    pub(crate) fn finish<T>(
        &self,
        generation: u64,
        result: ProvisionResult<T>,
        on_failure: impl FnOnce(&ProvisionError) -> AdapterState,
        on_success: impl FnOnce(&T) -> SessionEvent,
    ) -> ProvisionResult<T> {
        match &result {
            Ok(value) => {
                self.complete(generation, AdapterState::Connected);
                self.emit(&on_success(value));
            }
            Err(err) => {
                self.emit_error(err);
                self.complete(generation, on_failure(err));
            }
        }
        result
    }
}
