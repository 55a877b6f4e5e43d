use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, info, info_span, instrument};

use super::adapter::BleAdapter;
use super::model::{DeviceFilter, DeviceHandle};
use crate::error::DiscoveryError;
use crate::utils::duration_millis;

const SCAN_TICK_INTERVAL: Duration = Duration::from_millis(250);
const SCAN_EVENT_BUFFER: usize = 32;

/// Why a discovery stream stopped producing devices.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Display)]
pub enum ScanStopReason {
    /// A device satisfying the filter was seen.
    #[display("matched")]
    Matched,
    /// The scan window elapsed.
    #[display("timed_out")]
    TimedOut,
    /// The caller cancelled the scan.
    #[display("cancelled")]
    Cancelled,
    /// The adapter ended the scan on its own.
    #[display("exhausted")]
    Exhausted,
    /// The adapter failed while scanning.
    #[display("failed")]
    Failed(DiscoveryError),
}

#[derive(Debug)]
enum ScanEvent {
    Found(DeviceHandle),
    Finished(ScanStopReason),
}

/// Finite, lazy stream of discovered devices.
///
/// The underlying scan task stops once the stream is dropped. A stream that
/// has ended cannot be restarted; start a new discovery instead.
#[derive(Debug)]
pub struct DiscoveryStream {
    events: mpsc::Receiver<ScanEvent>,
    stop_reason: Option<ScanStopReason>,
    _scan_guard: DropGuard,
}

impl DiscoveryStream {
    /// Returns why the stream ended, once it has.
    #[must_use]
    pub fn stop_reason(&self) -> Option<&ScanStopReason> {
        self.stop_reason.as_ref()
    }
}

impl Stream for DiscoveryStream {
    type Item = DeviceHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.stop_reason.is_some() {
            return Poll::Ready(None);
        }

        match self.events.poll_recv(cx) {
            Poll::Ready(Some(ScanEvent::Found(device))) => Poll::Ready(Some(device)),
            Poll::Ready(Some(ScanEvent::Finished(reason))) => {
                self.stop_reason = Some(reason);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.stop_reason = Some(ScanStopReason::Exhausted);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Streams devices until `timeout`, cancellation, or the scan tick in which
/// `filter` first matches.
pub fn discover(
    adapter: Arc<dyn BleAdapter>,
    filter: DeviceFilter,
    timeout: Duration,
    cancel: CancellationToken,
) -> DiscoveryStream {
    spawn_scan(adapter, Some(filter), timeout, cancel)
}

/// Streams every advertised device until `timeout` or cancellation.
pub fn scan_all(
    adapter: Arc<dyn BleAdapter>,
    timeout: Duration,
    cancel: CancellationToken,
) -> DiscoveryStream {
    spawn_scan(adapter, None, timeout, cancel)
}

/// Finds the best device matching `filter`.
///
/// When several devices match before the scan stops, the strongest RSSI wins.
/// Devices without an RSSI rank lowest and ties keep the first device seen.
///
/// # Errors
///
/// Returns [`DiscoveryError::Timeout`] when the window elapses without a
/// match, [`DiscoveryError::NotFound`] when the adapter ends the scan first,
/// [`DiscoveryError::Cancelled`] on cancellation, and
/// [`DiscoveryError::AdapterUnavailable`] when scanning fails.
#[instrument(
    skip(adapter, cancel),
    level = "debug",
    fields(%filter, timeout_ms = duration_millis(timeout))
)]
pub async fn find_device(
    adapter: Arc<dyn BleAdapter>,
    filter: &DeviceFilter,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DeviceHandle, DiscoveryError> {
    let mut stream = discover(adapter, filter.clone(), timeout, cancel.clone());
    let mut best: Option<DeviceHandle> = None;
    while let Some(device) = stream.next().await {
        if !filter.matches(&device) {
            continue;
        }
        if best
            .as_ref()
            .is_none_or(|current| signal_rank(&device) > signal_rank(current))
        {
            best = Some(device);
        }
    }

    if let Some(device) = best {
        info!(address = device.address(), rssi = ?device.rssi(), "selected printer");
        return Ok(device);
    }

    match stream.stop_reason() {
        Some(ScanStopReason::Failed(error)) => Err(error.clone()),
        Some(ScanStopReason::Cancelled) => Err(DiscoveryError::Cancelled),
        Some(ScanStopReason::TimedOut) => Err(DiscoveryError::Timeout {
            filter: filter.to_string(),
            timeout_ms: duration_millis(timeout),
        }),
        _ => Err(DiscoveryError::NotFound {
            filter: filter.to_string(),
        }),
    }
}

fn signal_rank(device: &DeviceHandle) -> i32 {
    device.rssi().map_or(i32::MIN, i32::from)
}

fn spawn_scan(
    adapter: Arc<dyn BleAdapter>,
    filter: Option<DeviceFilter>,
    timeout: Duration,
    cancel: CancellationToken,
) -> DiscoveryStream {
    let (events, receiver) = mpsc::channel(SCAN_EVENT_BUFFER);
    let scan_token = cancel.child_token();
    let span = info_span!("scan", timeout_ms = duration_millis(timeout));
    tokio::spawn(
        run_scan(adapter, filter, timeout, scan_token.clone(), events).instrument(span),
    );

    DiscoveryStream {
        events: receiver,
        stop_reason: None,
        _scan_guard: scan_token.drop_guard(),
    }
}

async fn run_scan(
    adapter: Arc<dyn BleAdapter>,
    filter: Option<DeviceFilter>,
    timeout: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<ScanEvent>,
) {
    let deadline = Instant::now() + timeout;
    if let Err(error) = adapter.start_scan().await {
        let _ = events
            .send(ScanEvent::Finished(ScanStopReason::Failed(error)))
            .await;
        return;
    }

    let mut seen = HashSet::new();
    let reason = loop {
        let tick = tokio::select! {
            biased;
            () = cancel.cancelled() => break ScanStopReason::Cancelled,
            () = sleep_until(deadline) => break ScanStopReason::TimedOut,
            tick = adapter.scan_tick() => tick,
        };

        let devices = match tick {
            Ok(Some(devices)) => devices,
            Ok(None) => break ScanStopReason::Exhausted,
            Err(error) => break ScanStopReason::Failed(error),
        };

        let mut matched = false;
        for device in devices {
            if !seen.insert(device.device_id().to_string()) {
                continue;
            }
            info!(
                address = device.address(),
                name = device.name().unwrap_or("-"),
                rssi = ?device.rssi(),
                "discovered device"
            );
            matched |= filter.as_ref().is_some_and(|filter| filter.matches(&device));
            if events.send(ScanEvent::Found(device)).await.is_err() {
                stop_scan(adapter.as_ref()).await;
                return;
            }
        }
        if matched {
            break ScanStopReason::Matched;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break ScanStopReason::Cancelled,
            () = sleep_until(deadline) => break ScanStopReason::TimedOut,
            () = sleep(SCAN_TICK_INTERVAL) => {}
        }
    };

    debug!(%reason, devices = seen.len(), "scan finished");
    stop_scan(adapter.as_ref()).await;
    let _ = events.send(ScanEvent::Finished(reason)).await;
}

async fn stop_scan(adapter: &dyn BleAdapter) {
    if let Err(error) = adapter.stop_scan().await {
        debug!(?error, "failed to stop adapter scan cleanly");
    }
}
