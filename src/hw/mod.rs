mod adapter;
mod btleplug_backend;
mod connection;
mod discovery;
mod fake_backend;
mod handshake;
mod model;

pub use self::adapter::{BleAdapter, BleLink, NotificationStream, WriteMode};
pub use self::btleplug_backend::BtleplugAdapter;
pub use self::connection::{ConnectPolicy, Connection, connect};
pub use self::discovery::{DiscoveryStream, ScanStopReason, discover, find_device, scan_all};
pub use self::fake_backend::{
    AckBehaviour, FakeBackendConfig, FakeBleAdapter, FakeDeviceProbe, HexPayload, ScanFixture,
};
pub use self::handshake::{ReadySession, SessionEndpoints, handshake};
pub use self::model::{CharacteristicInfo, DeviceFilter, DeviceHandle, ServiceInfo};
