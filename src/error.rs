use serde_with::SerializeDisplay;
use strum_macros::{Display, EnumIter};
use thiserror::Error;

use crate::session::SessionState;
use crate::utils::format_hex;

/// Errors returned while scanning for the printer.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DiscoveryError {
    #[error("no device matching `{filter}` was advertised before the scan ended")]
    NotFound { filter: String },
    #[error("no device matching `{filter}` was advertised within {timeout_ms}ms")]
    Timeout { filter: String, timeout_ms: u64 },
    #[error("device scan was cancelled")]
    Cancelled,
    #[error("BLE adapter is unavailable: {detail}")]
    AdapterUnavailable { detail: String },
}

/// Errors returned while opening or holding a link to the printer.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConnectionError {
    #[error("connecting to `{device}` timed out after {timeout_ms}ms ({attempts} attempts)")]
    Timeout {
        device: String,
        timeout_ms: u64,
        attempts: u32,
    },
    #[error("`{device}` refused the connection after {attempts} attempts: {detail}")]
    Refused {
        device: String,
        detail: String,
        attempts: u32,
    },
    #[error("the printer link was dropped: {detail}")]
    Dropped { detail: String },
}

/// Errors returned while initialising a connected printer.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HandshakeError {
    #[error("none of the profile services are advertised: {candidates}")]
    ServiceNotFound { candidates: String },
    #[error("service `{service}` lacks a usable `{characteristic}` characteristic")]
    CharacteristicNotFound {
        service: String,
        characteristic: String,
    },
    #[error("printer answered the handshake with unexpected bytes [{}]", format_hex(.raw))]
    UnexpectedResponse { raw: Vec<u8> },
    #[error("handshake did not complete within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("initialisation command {index} could not be sent: {detail}")]
    CommandFailed { index: usize, detail: String },
}

/// Errors returned while rasterising text.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum RenderError {
    #[error("invalid render input: {reason}")]
    InvalidInput { reason: String },
}

impl RenderError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}

/// Why a single frame attempt was not accepted by the printer.
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Display)]
pub enum FrameFailure {
    #[display("no acknowledgement within {timeout_ms}ms")]
    AckTimeout { timeout_ms: u64 },
    #[display("printer reported a checksum mismatch")]
    ChecksumMismatch,
    #[display("unexpected response [{}]", format_hex(_0))]
    UnexpectedResponse(Vec<u8>),
}

/// Errors returned while transmitting raster frames.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TransportError {
    #[error("writing frame {sequence} failed: {detail}")]
    WriteFailed { sequence: u32, detail: String },
    #[error("frame {sequence} was not acknowledged within {timeout_ms}ms")]
    AckTimeout { sequence: u32, timeout_ms: u64 },
    #[error("frame {sequence} failed after {attempts} attempts: {last_failure}")]
    RetryExhausted {
        sequence: u32,
        attempts: u32,
        last_failure: FrameFailure,
    },
    #[error("printer rejected frame {sequence} with a checksum mismatch")]
    ChecksumMismatch { sequence: u32 },
    #[error("send was cancelled before frame {sequence}")]
    Cancelled { sequence: u32 },
    #[error("max payload of {max_payload} bytes cannot carry a frame")]
    InvalidFrameSize { max_payload: usize },
}

/// Errors returned by the printer session itself.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SessionError {
    #[error("printer is busy with another request")]
    Busy,
    #[error("printer session is `{state}`; reconnect before printing{}", cause_suffix(.cause))]
    NotReady {
        state: SessionState,
        cause: Option<String>,
    },
}

fn cause_suffix(cause: &Option<String>) -> String {
    cause
        .as_deref()
        .map(|cause| format!(" (last error: {cause})"))
        .unwrap_or_default()
}

/// Errors returned when validating printer configuration.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("print width {width_px}px must be a non-zero multiple of 8")]
    InvalidPrintWidth { width_px: u32 },
    #[error("max packet size {max_packet_size} leaves no room for a frame payload")]
    InvalidPacketSize { max_packet_size: usize },
    #[error("device filter cannot be empty")]
    EmptyDeviceFilter,
    #[error("protocol profile `{profile}` declares no endpoint candidates")]
    NoEndpointCandidates { profile: String },
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Errors returned when parsing fake backend fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake scan fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain three pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("invalid hex payload")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Failure reported by a BLE link primitive.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum LinkError {
    #[error("peripheral is not connected")]
    Disconnected,
    #[error("characteristic `{uuid}` is not available on this link")]
    UnknownCharacteristic { uuid: String },
    #[error("BLE operation failed: {detail}")]
    Operation { detail: String },
}

impl From<btleplug::Error> for LinkError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::NotConnected => Self::Disconnected,
            other => Self::Operation {
                detail: other.to_string(),
            },
        }
    }
}

/// Classification of a printer failure, as reported to callers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter, SerializeDisplay)]
pub enum ErrorKind {
    #[strum(to_string = "discovery.not_found")]
    DiscoveryNotFound,
    #[strum(to_string = "discovery.timeout")]
    DiscoveryTimeout,
    #[strum(to_string = "discovery.cancelled")]
    DiscoveryCancelled,
    #[strum(to_string = "discovery.adapter_unavailable")]
    AdapterUnavailable,
    #[strum(to_string = "connection.timeout")]
    ConnectionTimeout,
    #[strum(to_string = "connection.refused")]
    ConnectionRefused,
    #[strum(to_string = "connection.dropped")]
    ConnectionDropped,
    #[strum(to_string = "handshake.service_not_found")]
    ServiceNotFound,
    #[strum(to_string = "handshake.characteristic_not_found")]
    CharacteristicNotFound,
    #[strum(to_string = "handshake.unexpected_response")]
    UnexpectedResponse,
    #[strum(to_string = "handshake.timeout")]
    HandshakeTimeout,
    #[strum(to_string = "handshake.command_failed")]
    HandshakeCommandFailed,
    #[strum(to_string = "render.invalid_input")]
    InvalidInput,
    #[strum(to_string = "transport.write_failed")]
    WriteFailed,
    #[strum(to_string = "transport.ack_timeout")]
    AckTimeout,
    #[strum(to_string = "transport.retry_exhausted")]
    RetryExhausted,
    #[strum(to_string = "transport.checksum_mismatch")]
    ChecksumMismatch,
    #[strum(to_string = "transport.cancelled")]
    TransportCancelled,
    #[strum(to_string = "transport.invalid_frame_size")]
    InvalidFrameSize,
    #[strum(to_string = "session.busy")]
    Busy,
    #[strum(to_string = "session.not_ready")]
    NotReady,
    #[strum(to_string = "config.invalid")]
    InvalidConfig,
}

/// Top-level printer error returned by [`crate::PrinterSession::print_text`].
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PrinterError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PrinterError {
    /// Returns the classified error kind.
    ///
    /// ```
    /// use peripage::{ErrorKind, PrinterError, SessionError};
    ///
    /// let error = PrinterError::from(SessionError::Busy);
    /// assert_eq!(ErrorKind::Busy, error.kind());
    /// assert_eq!("session.busy", error.kind().to_string());
    /// ```
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Discovery(error) => match error {
                DiscoveryError::NotFound { .. } => ErrorKind::DiscoveryNotFound,
                DiscoveryError::Timeout { .. } => ErrorKind::DiscoveryTimeout,
                DiscoveryError::Cancelled => ErrorKind::DiscoveryCancelled,
                DiscoveryError::AdapterUnavailable { .. } => ErrorKind::AdapterUnavailable,
            },
            Self::Connection(error) => match error {
                ConnectionError::Timeout { .. } => ErrorKind::ConnectionTimeout,
                ConnectionError::Refused { .. } => ErrorKind::ConnectionRefused,
                ConnectionError::Dropped { .. } => ErrorKind::ConnectionDropped,
            },
            Self::Handshake(error) => match error {
                HandshakeError::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
                HandshakeError::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
                HandshakeError::UnexpectedResponse { .. } => ErrorKind::UnexpectedResponse,
                HandshakeError::Timeout { .. } => ErrorKind::HandshakeTimeout,
                HandshakeError::CommandFailed { .. } => ErrorKind::HandshakeCommandFailed,
            },
            Self::Render(RenderError::InvalidInput { .. }) => ErrorKind::InvalidInput,
            Self::Transport(error) => match error {
                TransportError::WriteFailed { .. } => ErrorKind::WriteFailed,
                TransportError::AckTimeout { .. } => ErrorKind::AckTimeout,
                TransportError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
                TransportError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
                TransportError::Cancelled { .. } => ErrorKind::TransportCancelled,
                TransportError::InvalidFrameSize { .. } => ErrorKind::InvalidFrameSize,
            },
            Self::Session(error) => match error {
                SessionError::Busy => ErrorKind::Busy,
                SessionError::NotReady { .. } => ErrorKind::NotReady,
            },
            Self::Config(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Returns the human-readable detail string for this error.
    #[must_use]
    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Returns whether this failure leaves the session in the `Error` state.
    #[must_use]
    pub fn forces_error_state(&self) -> bool {
        !matches!(self, Self::Render(_) | Self::Session(_) | Self::Config(_))
    }
}
