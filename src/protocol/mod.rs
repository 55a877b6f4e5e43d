mod checksum;

use std::time::Duration;

use bon::Builder;
use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::serde_as;

pub use self::checksum::ChecksumAlgorithm;
use crate::hw::WriteMode;
use crate::transport::FRAME_OVERHEAD;

pub(crate) const DATA_FRAME_TYPE: u8 = 0x01;
pub(crate) const PRINT_TRIGGER_FRAME_TYPE: u8 = 0x02;
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PRINT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// One service/characteristic combination a printer family may expose.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct EndpointCandidate {
    service_uuid: String,
    write_uuid: String,
    notify_uuid: Option<String>,
}

impl EndpointCandidate {
    /// Creates a candidate with a write characteristic and no notify channel.
    #[must_use]
    pub fn new(service_uuid: impl Into<String>, write_uuid: impl Into<String>) -> Self {
        Self {
            service_uuid: service_uuid.into().to_ascii_lowercase(),
            write_uuid: write_uuid.into().to_ascii_lowercase(),
            notify_uuid: None,
        }
    }

    /// Declares the notify characteristic used for acknowledgements.
    #[must_use]
    pub fn with_notify(mut self, notify_uuid: impl Into<String>) -> Self {
        self.notify_uuid = Some(notify_uuid.into().to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn write_uuid(&self) -> &str {
        &self.write_uuid
    }

    #[must_use]
    pub fn notify_uuid(&self) -> Option<&str> {
        self.notify_uuid.as_deref()
    }
}

/// Byte pattern a device response is matched against.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ResponsePattern {
    #[serde_as(as = "Hex")]
    bytes: Vec<u8>,
    prefix: bool,
}

impl ResponsePattern {
    /// Matches responses equal to `bytes`.
    #[must_use]
    pub fn exact(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            prefix: false,
        }
    }

    /// Matches responses starting with `bytes`.
    #[must_use]
    pub fn prefix(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            prefix: true,
        }
    }

    /// Returns the pattern bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns whether `payload` satisfies the pattern.
    ///
    /// ```
    /// use peripage::ResponsePattern;
    ///
    /// let ready = ResponsePattern::prefix([0x10, 0xFF]);
    /// assert!(ready.matches(&[0x10, 0xFF, 0x40, 0x00]));
    /// assert!(!ResponsePattern::exact([0x10, 0xFF]).matches(&[0x10, 0xFF, 0x40]));
    /// ```
    #[must_use]
    pub fn matches(&self, payload: &[u8]) -> bool {
        if self.prefix {
            payload.starts_with(&self.bytes)
        } else {
            payload == self.bytes.as_slice()
        }
    }
}

/// How the transport learns that a frame was accepted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The device notifies an acknowledgement per frame.
    Notify { ack_timeout: Duration },
    /// The device never acknowledges; frames are paced by a fixed delay.
    FixedDelay { inter_frame: Duration },
}

/// Device-family constants parameterising discovery, handshake and transport.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Builder)]
pub struct ProtocolProfile {
    #[builder(into)]
    name: String,
    endpoint_candidates: Vec<EndpointCandidate>,
    #[builder(default)]
    #[serde_as(as = "Vec<Hex>")]
    init_commands: Vec<Vec<u8>>,
    ready_pattern: Option<ResponsePattern>,
    #[builder(default)]
    checksum: ChecksumAlgorithm,
    #[builder(default = AckMode::Notify { ack_timeout: DEFAULT_ACK_TIMEOUT })]
    ack_mode: AckMode,
    ack_pattern: ResponsePattern,
    nak_pattern: Option<ResponsePattern>,
    print_complete_pattern: Option<ResponsePattern>,
    #[builder(default = DEFAULT_PRINT_COMPLETE_TIMEOUT)]
    print_complete_timeout: Duration,
    #[builder(default = DATA_FRAME_TYPE)]
    data_frame_type: u8,
    #[builder(default = PRINT_TRIGGER_FRAME_TYPE)]
    print_trigger_frame_type: u8,
    #[builder(default)]
    #[serde_as(as = "Hex")]
    print_trigger_payload: Vec<u8>,
    max_payload: Option<usize>,
    #[builder(default = WriteMode::WithoutResponse)]
    write_mode: WriteMode,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::peripage_a6()
    }
}

impl ProtocolProfile {
    /// Profile for the PeriPage A6 family.
    ///
    /// The identifiers and command bytes are unverified placeholders until
    /// they are captured from hardware. Vendor UUIDs are listed before the
    /// generic serial-over-GATT ones.
    #[must_use]
    pub fn peripage_a6() -> Self {
        Self::builder()
            .name("peripage_a6")
            .endpoint_candidates(vec![
                EndpointCandidate::new(
                    "0000ff00-0000-1000-8000-00805f9b34fb",
                    "0000ff02-0000-1000-8000-00805f9b34fb",
                )
                .with_notify("0000ff01-0000-1000-8000-00805f9b34fb"),
                EndpointCandidate::new(
                    "0000ae30-0000-1000-8000-00805f9b34fb",
                    "0000ae01-0000-1000-8000-00805f9b34fb",
                )
                .with_notify("0000ae02-0000-1000-8000-00805f9b34fb"),
                EndpointCandidate::new(
                    "0000ffe0-0000-1000-8000-00805f9b34fb",
                    "0000ffe1-0000-1000-8000-00805f9b34fb",
                ),
            ])
            .init_commands(vec![vec![0x10, 0xFF, 0xFE, 0x01], vec![0x10, 0xFF, 0x40]])
            .ready_pattern(ResponsePattern::prefix([0x10, 0xFF, 0x40]))
            .ack_pattern(ResponsePattern::exact([0xAA, 0x01]))
            .nak_pattern(ResponsePattern::exact([0xAA, 0xEE]))
            .print_complete_pattern(ResponsePattern::exact([0xAA, 0x0F]))
            .print_trigger_payload(vec![0x1B, 0x4A, 0x40])
            .build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Candidate endpoint sets, ordered by preference.
    #[must_use]
    pub fn endpoint_candidates(&self) -> &[EndpointCandidate] {
        &self.endpoint_candidates
    }

    /// Initialisation commands, sent strictly in order.
    #[must_use]
    pub fn init_commands(&self) -> &[Vec<u8>] {
        &self.init_commands
    }

    #[must_use]
    pub fn ready_pattern(&self) -> Option<&ResponsePattern> {
        self.ready_pattern.as_ref()
    }

    #[must_use]
    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    #[must_use]
    pub fn ack_pattern(&self) -> &ResponsePattern {
        &self.ack_pattern
    }

    #[must_use]
    pub fn nak_pattern(&self) -> Option<&ResponsePattern> {
        self.nak_pattern.as_ref()
    }

    #[must_use]
    pub fn print_complete_pattern(&self) -> Option<&ResponsePattern> {
        self.print_complete_pattern.as_ref()
    }

    #[must_use]
    pub fn print_complete_timeout(&self) -> Duration {
        self.print_complete_timeout
    }

    #[must_use]
    pub fn data_frame_type(&self) -> u8 {
        self.data_frame_type
    }

    #[must_use]
    pub fn print_trigger_frame_type(&self) -> u8 {
        self.print_trigger_frame_type
    }

    #[must_use]
    pub fn print_trigger_payload(&self) -> &[u8] {
        &self.print_trigger_payload
    }

    #[must_use]
    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Resolves the frame payload limit for a packet size.
    ///
    /// A profile override wins over the size derived from `max_packet_size`.
    ///
    /// ```
    /// use peripage::ProtocolProfile;
    ///
    /// assert_eq!(508, ProtocolProfile::peripage_a6().max_payload_for(512));
    /// ```
    #[must_use]
    pub fn max_payload_for(&self, max_packet_size: usize) -> usize {
        self.max_payload
            .unwrap_or_else(|| max_packet_size.saturating_sub(FRAME_OVERHEAD))
    }
}
