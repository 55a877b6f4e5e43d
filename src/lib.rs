mod app;
mod cli;
mod config;
mod error;
mod hw;
mod notification;
mod printer;
mod protocol;
mod render;
mod session;
mod telemetry;
mod terminal;
mod transport;
mod utils;

pub use app::{Backend, Invocation, run, run_with_clients};
pub use cli::{
    Args, Command, FakeArgs, LogLevel, OutputFormat, PreviewArgs, PrintArgs, PrinterArgs,
};
pub use config::PrinterConfig;
pub use error::{
    ConfigError, ConnectionError, DiscoveryError, ErrorKind, FixtureError, FrameFailure,
    HandshakeError, LinkError, PrinterError, RenderError, SessionError, TransportError,
};
pub use hw::{
    AckBehaviour, BleAdapter, BleLink, BtleplugAdapter, CharacteristicInfo, ConnectPolicy,
    Connection, DeviceFilter, DeviceHandle, DiscoveryStream, FakeBackendConfig, FakeBleAdapter,
    FakeDeviceProbe, HexPayload, NotificationStream, ReadySession, ScanFixture, ScanStopReason,
    ServiceInfo, SessionEndpoints, WriteMode, connect, discover, find_device, handshake, scan_all,
};
pub use notification::NotifyEvent;
pub use printer::{StdoutPrinter, TextPrinter};
pub use protocol::{AckMode, ChecksumAlgorithm, EndpointCandidate, ProtocolProfile, ResponsePattern};
pub use render::{BitmapImage, BitmapRenderer, DitherMode, RenderConfig};
pub use session::{PrintReceipt, PrinterSession, SessionState};
pub use terminal::{SystemTerminalClient, TerminalClient};
pub use transport::{
    FRAME_OVERHEAD, Frame, FrameCodecError, FrameRecord, MAX_FRAME_PAYLOAD, PacketTransport,
    SendReceipt,
};
