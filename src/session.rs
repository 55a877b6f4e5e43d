use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_with::SerializeDisplay;
use strum_macros::Display;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::PrinterConfig;
use crate::error::{ConfigError, ConnectionError, PrinterError, SessionError, TransportError};
use crate::hw::{BleAdapter, DeviceHandle, ReadySession, connect, find_device, handshake};
use crate::render::BitmapRenderer;
use crate::transport::{FrameRecord, PacketTransport, SendReceipt};

/// Lifecycle of a printer session.
///
/// `Error` is left only through [`PrinterSession::reconnect`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, SerializeDisplay)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Scanning,
    Connecting,
    Handshaking,
    Ready,
    Printing,
    Error,
}

/// Summary of one printed text.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct PrintReceipt {
    device: Option<DeviceHandle>,
    pages: usize,
    rows: u32,
    frames: Vec<FrameRecord>,
    print_confirmed: bool,
}

impl PrintReceipt {
    pub(crate) fn new(device: Option<DeviceHandle>, pages: usize, rows: u32) -> Self {
        Self {
            device,
            pages,
            rows,
            frames: Vec::new(),
            print_confirmed: false,
        }
    }

    fn with_send(mut self, send: SendReceipt) -> Self {
        self.print_confirmed = send.print_confirmed();
        self.frames = send.frames().to_vec();
        self
    }

    /// Printer that received the job, if any.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Total raster rows across all pages.
    #[must_use]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    #[must_use]
    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    #[must_use]
    pub fn print_confirmed(&self) -> bool {
        self.print_confirmed
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    ready: Option<ReadySession>,
}

/// A logical printer: discovery, connection, handshake and printing behind
/// one entry point.
///
/// Calls are never queued; a call made while another is in flight fails with
/// [`SessionError::Busy`].
#[derive(Debug)]
pub struct PrinterSession {
    adapter: Arc<dyn BleAdapter>,
    config: PrinterConfig,
    renderer: BitmapRenderer,
    transport: PacketTransport,
    slot: AsyncMutex<SessionSlot>,
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<PrinterError>>,
}

impl PrinterSession {
    /// Creates a disconnected session.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is invalid.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: PrinterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let renderer = BitmapRenderer::new(config.render_config())?;
        let transport = PacketTransport::new(
            config.protocol_profile().clone(),
            config.max_packet_size(),
            config.frame_retries(),
        )
        .map_err(|_| ConfigError::InvalidPacketSize {
            max_packet_size: config.max_packet_size(),
        })?;
        let (state, _receiver) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            adapter,
            config,
            renderer,
            transport,
            slot: AsyncMutex::new(SessionSlot::default()),
            state,
            last_error: Mutex::new(None),
        })
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns a receiver observing every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the failure that put the session into `Error`.
    #[must_use]
    pub fn last_error(&self) -> Option<PrinterError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    /// Prints `text`, connecting first when the session is not ready.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] when another call is in flight,
    /// [`SessionError::NotReady`] while in `Error`, and otherwise the failure
    /// of whichever stage failed.
    pub async fn print_text(&self, text: &str) -> Result<PrintReceipt, PrinterError> {
        self.print_text_with_cancellation(text, &CancellationToken::new())
            .await
    }

    /// Prints `text`, observing `cancel` between scan ticks and frames.
    ///
    /// # Errors
    ///
    /// See [`PrinterSession::print_text`].
    #[instrument(skip(self, text, cancel), level = "info", fields(chars = text.chars().count()))]
    pub async fn print_text_with_cancellation(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<PrintReceipt, PrinterError> {
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy)?;

        let state = self.state();
        if state == SessionState::Error {
            return Err(SessionError::NotReady {
                state,
                cause: self.last_error().map(|error| error.detail()),
            }
            .into());
        }

        let link_alive = match slot.ready.as_ref() {
            Some(ready) => Some(ready.is_alive().await),
            None => None,
        };
        match link_alive {
            Some(true) => {}
            Some(false) => {
                let error = ConnectionError::Dropped {
                    detail: "link lost while idle".to_string(),
                };
                return Err(self.fail(&mut slot, error.into()).await);
            }
            None => {
                if let Err(error) = self.establish(&mut slot, cancel).await {
                    return Err(self.fail(&mut slot, error).await);
                }
            }
        }

        self.set_state(SessionState::Printing);
        let _printing = PrintingGuard(&self.state);
        let pages = match self.renderer.render(text) {
            Ok(pages) => pages,
            Err(error) => {
                debug!(%error, "render rejected input");
                self.set_state(SessionState::Ready);
                return Err(error.into());
            }
        };

        let Some(ready) = slot.ready.as_mut() else {
            let error = ConnectionError::Dropped {
                detail: "connection released before printing".to_string(),
            };
            return Err(self.fail(&mut slot, error.into()).await);
        };
        let rows = pages.iter().map(|page| page.rows()).sum();
        let receipt = PrintReceipt::new(Some(ready.device().clone()), pages.len(), rows);

        match self.transport.send(ready, &pages, cancel).await {
            Ok(send) => {
                self.set_state(SessionState::Ready);
                Ok(receipt.with_send(send))
            }
            Err(error) => {
                let error = classify_send_failure(ready, error).await;
                Err(self.fail(&mut slot, error).await)
            }
        }
    }

    /// Drops any connection, clears the last error and connects again.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] when another call is in flight, or the
    /// failure of the discovery, connect or handshake stage.
    #[instrument(skip(self), level = "info")]
    pub async fn reconnect(&self) -> Result<(), PrinterError> {
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy)?;

        release(&mut slot).await;
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.set_state(SessionState::Disconnected);

        if let Err(error) = self.establish(&mut slot, &CancellationToken::new()).await {
            return Err(self.fail(&mut slot, error).await);
        }
        Ok(())
    }

    /// Tears the session down, releasing the connection.
    pub async fn close(self) {
        let mut slot = self.slot.into_inner();
        release(&mut slot).await;
        self.state.send_replace(SessionState::Disconnected);
        info!("printer session closed");
    }

    async fn establish(
        &self,
        slot: &mut SessionSlot,
        cancel: &CancellationToken,
    ) -> Result<(), PrinterError> {
        self.set_state(SessionState::Scanning);
        let device = find_device(
            Arc::clone(&self.adapter),
            self.config.device_filter(),
            self.config.scan_timeout(),
            cancel,
        )
        .await?;

        self.set_state(SessionState::Connecting);
        let connection = connect(
            self.adapter.as_ref(),
            &device,
            &self.config.connect_policy(),
            cancel,
        )
        .await?;

        self.set_state(SessionState::Handshaking);
        let ready = handshake(
            connection,
            self.config.protocol_profile(),
            self.config.handshake_timeout(),
        )
        .await?;

        slot.ready = Some(ready);
        self.set_state(SessionState::Ready);
        Ok(())
    }

    async fn fail(&self, slot: &mut SessionSlot, error: PrinterError) -> PrinterError {
        if error.forces_error_state() {
            warn!(kind = %error.kind(), %error, "printer session failed");
            release(slot).await;
            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
            self.set_state(SessionState::Error);
        } else if slot.ready.is_some() {
            self.set_state(SessionState::Ready);
        } else {
            self.set_state(SessionState::Disconnected);
        }
        error
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "session state changed");
        }
    }
}

/// Moves a session left in `Printing` back to `Ready` when the print future
/// is dropped before it finishes.
struct PrintingGuard<'a>(&'a watch::Sender<SessionState>);

impl Drop for PrintingGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.0.send_if_modified(|state| {
            if *state == SessionState::Printing {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if abandoned {
            warn!("print abandoned mid-send; session returned to ready");
        }
    }
}

async fn release(slot: &mut SessionSlot) {
    let Some(ready) = slot.ready.take() else {
        return;
    };
    if let Err(error) = ready.disconnect().await {
        debug!(%error, "failed to disconnect printer");
    }
}

/// A failed write on a dead link is reported as a dropped connection.
async fn classify_send_failure(ready: &ReadySession, error: TransportError) -> PrinterError {
    if let TransportError::WriteFailed { detail, .. } = &error
        && !ready.is_alive().await
    {
        return ConnectionError::Dropped {
            detail: detail.clone(),
        }
        .into();
    }
    error.into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::error::{DiscoveryError, ErrorKind, HandshakeError};
    use crate::hw::{FakeBackendConfig, FakeBleAdapter, FakeDeviceProbe};

    const FIXTURE: &str = "AA:BB:CC:DD:EE:FF|PeriPage_A6|-40";

    fn session(config: FakeBackendConfig) -> (PrinterSession, FakeDeviceProbe) {
        let adapter = FakeBleAdapter::new(config);
        let probe = adapter.probe();
        let printer_config = PrinterConfig::builder()
            .device_filter("PeriPage_A6")
            .scan_timeout(Duration::from_secs(2))
            .build();
        let session = PrinterSession::new(Arc::new(adapter), printer_config)
            .expect("config should be valid");
        (session, probe)
    }

    fn fake() -> FakeBackendConfig {
        FakeBackendConfig::single_device(FIXTURE).expect("fixture should parse")
    }

    #[rstest]
    #[case(SessionState::Disconnected, "disconnected")]
    #[case(SessionState::Handshaking, "handshaking")]
    #[case(SessionState::Error, "error")]
    fn state_labels_are_snake_case(#[case] state: SessionState, #[case] expected: &str) {
        assert_eq!(expected, state.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn print_from_disconnected_connects_and_returns_to_ready() {
        let (session, probe) = session(fake());
        let mut states = session.subscribe_state();
        assert_eq!(SessionState::Disconnected, *states.borrow_and_update());

        let receipt = session.print_text("Hello").await.expect("print should succeed");

        assert!(states.has_changed().expect("sender should be alive"));
        assert_eq!(SessionState::Ready, *states.borrow_and_update());
        assert_eq!(1, receipt.pages());
        assert_eq!(20, receipt.rows());
        assert!(receipt.print_confirmed());
        assert_eq!(
            Some("AA:BB:CC:DD:EE:FF"),
            receipt.device().map(DeviceHandle::address)
        );
        assert_eq!(3, probe.written_frames().len());
    }

    #[tokio::test(start_paused = true)]
    async fn second_print_reuses_connection() {
        let (session, probe) = session(fake());

        session.print_text("one").await.expect("first print should succeed");
        session.print_text("two").await.expect("second print should succeed");

        assert_eq!(1, probe.connect_attempts());
        assert_eq!(6, probe.written_frames().len());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_text_keeps_session_ready() {
        let (session, _probe) = session(fake());
        session.print_text("warm up").await.expect("print should succeed");

        let result = session.print_text(&"x".repeat(5_000)).await;

        assert_matches!(result, Err(PrinterError::Render(_)));
        assert_eq!(SessionState::Ready, session.state());
        assert_eq!(None, session.last_error());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_printer_enters_error_until_reconnect() {
        let config = FakeBackendConfig::single_device("AA:BB:CC:DD:EE:FF|Other|-40")
            .expect("fixture should parse");
        let (session, _probe) = session(config);

        let first = session.print_text("Hello").await;
        assert_matches!(
            first,
            Err(PrinterError::Discovery(DiscoveryError::Timeout { .. }))
        );
        assert_eq!(SessionState::Error, session.state());

        let second = session.print_text("Hello").await;
        assert_matches!(
            second,
            Err(PrinterError::Session(SessionError::NotReady {
                state: SessionState::Error,
                cause: Some(_)
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_failure_releases_connection() {
        let config = FakeBackendConfig::builder()
            .scan_fixture(FIXTURE.parse().expect("fixture should parse"))
            .ready_response("00".parse().expect("hex should parse"))
            .build();
        let (session, probe) = session(config);

        let result = session.print_text("Hello").await;

        assert_matches!(
            result,
            Err(PrinterError::Handshake(HandshakeError::UnexpectedResponse { .. }))
        );
        assert_eq!(SessionState::Error, session.state());
        assert!(!probe.is_connected());
        assert_eq!(
            Some(ErrorKind::UnexpectedResponse),
            session.last_error().map(|error| error.kind())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_disconnects() {
        let (session, probe) = session(fake());
        session.print_text("Hello").await.expect("print should succeed");

        session.close().await;

        assert!(!probe.is_connected());
        assert_eq!(1, probe.disconnects());
    }
}
