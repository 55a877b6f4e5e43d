use std::time::Duration;

use bon::Builder;

use crate::error::ConfigError;
use crate::hw::{ConnectPolicy, DeviceFilter};
use crate::protocol::ProtocolProfile;
use crate::render::RenderConfig;
use crate::transport::MAX_FRAME_PAYLOAD;

pub(crate) const DEFAULT_DEVICE_NAME: &str = "Peripage";
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PACKET_SIZE: usize = 512;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_PRINT_WIDTH_PX: u32 = 384;

/// Everything a [`PrinterSession`](crate::PrinterSession) needs to reach and
/// drive a printer.
///
/// ```
/// use std::time::Duration;
///
/// use peripage::PrinterConfig;
///
/// let config = PrinterConfig::builder()
///     .device_filter("PeriPage_A6")
///     .scan_timeout(Duration::from_secs(5))
///     .build();
/// assert!(config.validate().is_ok());
/// assert_eq!(384, config.print_width_px());
/// ```
#[derive(Debug, Clone, Builder)]
pub struct PrinterConfig {
    #[builder(into, default = DeviceFilter::Name(DEFAULT_DEVICE_NAME.to_string()))]
    device_filter: DeviceFilter,
    #[builder(default = DEFAULT_SCAN_TIMEOUT)]
    scan_timeout: Duration,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    /// Extra connect attempts after the first one fails.
    #[builder(default = DEFAULT_RETRIES)]
    connect_retries: u32,
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT)]
    handshake_timeout: Duration,
    /// Largest single write, frame overhead included.
    #[builder(default = DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: usize,
    /// Extra writes of a frame after the first one is not accepted.
    #[builder(default = DEFAULT_RETRIES)]
    frame_retries: u32,
    #[builder(default = DEFAULT_PRINT_WIDTH_PX)]
    print_width_px: u32,
    #[builder(default)]
    protocol_profile: ProtocolProfile,
    #[builder(default)]
    render: RenderConfig,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PrinterConfig {
    #[must_use]
    pub fn device_filter(&self) -> &DeviceFilter {
        &self.device_filter
    }

    #[must_use]
    pub fn scan_timeout(&self) -> Duration {
        self.scan_timeout
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    #[must_use]
    pub fn frame_retries(&self) -> u32 {
        self.frame_retries
    }

    #[must_use]
    pub fn print_width_px(&self) -> u32 {
        self.print_width_px
    }

    #[must_use]
    pub fn protocol_profile(&self) -> &ProtocolProfile {
        &self.protocol_profile
    }

    /// Render options with the configured print width applied.
    #[must_use]
    pub fn render_config(&self) -> RenderConfig {
        self.render.clone().with_width_px(self.print_width_px)
    }

    /// Connect bounds derived from the timeout and retry settings.
    #[must_use]
    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy::builder()
            .connect_timeout(self.connect_timeout)
            .connect_retries(self.connect_retries)
            .build()
    }

    /// Checks the settings before a session is built.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_filter.is_empty() {
            return Err(ConfigError::EmptyDeviceFilter);
        }
        if self.print_width_px == 0 || !self.print_width_px.is_multiple_of(8) {
            return Err(ConfigError::InvalidPrintWidth {
                width_px: self.print_width_px,
            });
        }
        let max_payload = self.protocol_profile.max_payload_for(self.max_packet_size);
        if max_payload == 0 || max_payload > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::InvalidPacketSize {
                max_packet_size: self.max_packet_size,
            });
        }
        if self.protocol_profile.endpoint_candidates().is_empty() {
            return Err(ConfigError::NoEndpointCandidates {
                profile: self.protocol_profile.name().to_string(),
            });
        }
        self.render_config().validate()?;
        Ok(())
    }
}
