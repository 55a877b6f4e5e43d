use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument};

use super::adapter::{BleAdapter, BleLink, NotificationStream, WriteMode};
use super::model::{CharacteristicInfo, DeviceHandle, ServiceInfo};
use crate::error::{DiscoveryError, FixtureError, LinkError};
use crate::protocol::{AckMode, ProtocolProfile};
use crate::transport::Frame;

const DEFAULT_NAK: [u8; 1] = [0xEE];

/// Parsed fake scan fixture records (`address|name|rssi;...`).
///
/// `-` stands for a missing name or RSSI.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<DeviceHandle>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Parsed fake hex payload.
#[derive(Debug, Clone, derive_more::Into)]
pub struct HexPayload {
    payload: Vec<u8>,
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(Self {
            payload: hex::decode(cleaned)?,
        })
    }
}

/// How the simulated printer acknowledges frames.
///
/// Frame numbers count accepted frames from 1, so a retried frame keeps its
/// number until the printer acknowledges it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum AckBehaviour {
    /// Acknowledge every valid frame.
    #[default]
    Always,
    /// Never answer.
    Silent,
    /// Stay silent for the first `times` writes of frame `frame`.
    DropAck { frame: u32, times: u32 },
    /// Answer the first `times` writes of frame `frame` with a NAK.
    Nak { frame: u32, times: u32 },
}

/// Settings for constructing a fake BLE adapter.
#[derive(Debug, Clone, Builder)]
pub struct FakeBackendConfig {
    scan_fixture: ScanFixture,
    /// Devices become visible once this much time has passed since scan start.
    #[builder(default)]
    discovery_delay: Duration,
    /// Number of scan ticks after which the adapter ends the scan.
    scan_ticks: Option<u32>,
    #[builder(default)]
    profile: ProtocolProfile,
    /// Overrides the GATT table derived from the profile's first candidate.
    services: Option<Vec<ServiceInfo>>,
    /// Notification sent after the final init command. Defaults to the
    /// profile's ready pattern; an empty payload suppresses the reply.
    ready_response: Option<HexPayload>,
    #[builder(default)]
    ack_behaviour: AckBehaviour,
    #[builder(default)]
    ack_delay: Duration,
    #[builder(default = true)]
    print_complete: bool,
    #[builder(default)]
    print_complete_delay: Duration,
    /// Number of initial connect attempts that are refused.
    #[builder(default)]
    refuse_connects: u32,
    /// Number of initial connect attempts that never complete.
    #[builder(default)]
    hang_connects: u32,
}

impl FakeBackendConfig {
    /// Builds a config that advertises a single device.
    ///
    /// # Errors
    ///
    /// Returns an error if the fixture cannot be parsed.
    pub fn single_device(fixture: &str) -> Result<Self, FixtureError> {
        Ok(Self::builder().scan_fixture(fixture.parse()?).build())
    }
}

/// Fake BLE adapter simulating one thermal printer.
#[derive(Debug, Clone)]
pub struct FakeBleAdapter {
    devices: Vec<DeviceHandle>,
    discovery_delay: Duration,
    scan_ticks: Option<u32>,
    state: Arc<Mutex<FakeDeviceState>>,
}

impl FakeBleAdapter {
    /// Creates a fake adapter from explicit settings.
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        let services = config
            .services
            .unwrap_or_else(|| default_services(&config.profile));
        let ready_response = config.ready_response.map(Into::into).or_else(|| {
            config
                .profile
                .ready_pattern()
                .map(|pattern| pattern.bytes().to_vec())
        });

        let state = FakeDeviceState {
            profile: config.profile,
            services,
            ready_response,
            ack_behaviour: config.ack_behaviour,
            ack_delay: config.ack_delay,
            print_complete: config.print_complete,
            print_complete_delay: config.print_complete_delay,
            refuse_connects: config.refuse_connects,
            hang_connects: config.hang_connects,
            scan_started: None,
            ticks: 0,
            connected: false,
            init_commands_seen: 0,
            accepted_frames: 0,
            current_frame_writes: 0,
            subscribers: HashMap::new(),
            writes: Vec::new(),
            connect_attempts: 0,
            disconnects: 0,
        };

        Self {
            devices: config.scan_fixture.into(),
            discovery_delay: config.discovery_delay,
            scan_ticks: config.scan_ticks,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Returns a handle for inspecting and disturbing the simulated printer.
    #[must_use]
    pub fn probe(&self) -> FakeDeviceProbe {
        FakeDeviceProbe {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl BleAdapter for FakeBleAdapter {
    async fn start_scan(&self) -> Result<(), DiscoveryError> {
        let mut state = lock(&self.state);
        state.scan_started = Some(Instant::now());
        state.ticks = 0;
        Ok(())
    }

    async fn scan_tick(&self) -> Result<Option<Vec<DeviceHandle>>, DiscoveryError> {
        let mut state = lock(&self.state);
        let Some(started) = state.scan_started else {
            return Err(DiscoveryError::AdapterUnavailable {
                detail: "scan was not started".to_string(),
            });
        };
        if self.scan_ticks.is_some_and(|limit| state.ticks >= limit) {
            return Ok(None);
        }
        state.ticks += 1;

        if started.elapsed() < self.discovery_delay {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(self.devices.clone()))
    }

    async fn stop_scan(&self) -> Result<(), DiscoveryError> {
        lock(&self.state).scan_started = None;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(address = device.address()))]
    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn BleLink>, LinkError> {
        let outcome = {
            let mut state = lock(&self.state);
            state.connect_attempts += 1;
            if state.hang_connects > 0 {
                state.hang_connects -= 1;
                ConnectOutcome::Hang
            } else if state.refuse_connects > 0 {
                state.refuse_connects -= 1;
                ConnectOutcome::Refuse
            } else {
                state.connected = true;
                state.init_commands_seen = 0;
                state.accepted_frames = 0;
                state.current_frame_writes = 0;
                ConnectOutcome::Accept
            }
        };

        match outcome {
            ConnectOutcome::Hang => {
                std::future::pending::<()>().await;
                Err(LinkError::Disconnected)
            }
            ConnectOutcome::Refuse => Err(LinkError::Operation {
                detail: "connection refused by peer".to_string(),
            }),
            ConnectOutcome::Accept => Ok(Arc::new(FakeLink {
                state: Arc::clone(&self.state),
            })),
        }
    }
}

enum ConnectOutcome {
    Hang,
    Refuse,
    Accept,
}

/// Inspection handle for the simulated printer.
#[derive(Debug, Clone)]
pub struct FakeDeviceProbe {
    state: Arc<Mutex<FakeDeviceState>>,
}

impl FakeDeviceProbe {
    /// Returns every payload written to the printer, init commands included.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Returns the frames written after the handshake, in write order.
    #[must_use]
    pub fn written_frames(&self) -> Vec<Frame> {
        let state = lock(&self.state);
        let init_len = state.profile.init_commands().len();
        state
            .writes
            .iter()
            .skip(init_len)
            .filter_map(|bytes| Frame::decode(bytes).ok())
            .collect()
    }

    /// Returns how many connection attempts the adapter has seen.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).connect_attempts
    }

    /// Returns how many times the link has been closed by the host.
    #[must_use]
    pub fn disconnects(&self) -> u32 {
        lock(&self.state).disconnects
    }

    /// Returns whether the simulated link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Simulates the printer going out of range.
    pub fn drop_link(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.subscribers.clear();
    }

    /// Changes how subsequent frames are acknowledged.
    pub fn set_ack_behaviour(&self, behaviour: AckBehaviour) {
        lock(&self.state).ack_behaviour = behaviour;
    }

    /// Changes how long the printer waits before acknowledging.
    pub fn set_ack_delay(&self, delay: Duration) {
        lock(&self.state).ack_delay = delay;
    }
}

#[derive(Debug)]
struct FakeDeviceState {
    profile: ProtocolProfile,
    services: Vec<ServiceInfo>,
    ready_response: Option<Vec<u8>>,
    ack_behaviour: AckBehaviour,
    ack_delay: Duration,
    print_complete: bool,
    print_complete_delay: Duration,
    refuse_connects: u32,
    hang_connects: u32,
    scan_started: Option<Instant>,
    ticks: u32,
    connected: bool,
    init_commands_seen: usize,
    accepted_frames: u32,
    current_frame_writes: u32,
    subscribers: HashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    writes: Vec<Vec<u8>>,
    connect_attempts: u32,
    disconnects: u32,
}

impl FakeDeviceState {
    /// Computes the printer's replies to one write.
    fn respond_to(&mut self, payload: &[u8]) -> Vec<(Duration, Vec<u8>)> {
        let init_len = self.profile.init_commands().len();
        if self.init_commands_seen < init_len {
            self.init_commands_seen += 1;
            if self.init_commands_seen == init_len
                && let Some(ready) = &self.ready_response
                && !ready.is_empty()
            {
                return vec![(Duration::ZERO, ready.clone())];
            }
            return Vec::new();
        }

        let Ok(frame) = Frame::decode(payload) else {
            return vec![(self.ack_delay, self.nak())];
        };
        if !frame.checksum_valid(self.profile.checksum()) {
            return vec![(self.ack_delay, self.nak())];
        }
        if matches!(self.profile.ack_mode(), AckMode::FixedDelay { .. }) {
            self.accept_frame();
            return self.completion_for(&frame);
        }

        let frame_number = self.accepted_frames + 1;
        self.current_frame_writes += 1;
        match self.ack_behaviour {
            AckBehaviour::Silent => return Vec::new(),
            AckBehaviour::DropAck { frame: target, times }
                if target == frame_number && self.current_frame_writes <= times =>
            {
                return Vec::new();
            }
            AckBehaviour::Nak { frame: target, times }
                if target == frame_number && self.current_frame_writes <= times =>
            {
                return vec![(self.ack_delay, self.nak())];
            }
            _ => {}
        }

        self.accept_frame();
        let mut replies = vec![(self.ack_delay, self.profile.ack_pattern().bytes().to_vec())];
        replies.extend(self.completion_for(&frame));
        replies
    }

    fn accept_frame(&mut self) {
        self.accepted_frames += 1;
        self.current_frame_writes = 0;
    }

    fn completion_for(&self, frame: &Frame) -> Vec<(Duration, Vec<u8>)> {
        if !self.print_complete || frame.frame_type() != self.profile.print_trigger_frame_type() {
            return Vec::new();
        }
        self.profile
            .print_complete_pattern()
            .map(|pattern| {
                vec![(
                    self.ack_delay + self.print_complete_delay,
                    pattern.bytes().to_vec(),
                )]
            })
            .unwrap_or_default()
    }

    fn nak(&self) -> Vec<u8> {
        self.profile
            .nak_pattern()
            .map_or_else(|| DEFAULT_NAK.to_vec(), |pattern| pattern.bytes().to_vec())
    }

    /// Delivers replies in order; each delay counts from the write.
    fn notify_all(&self, replies: Vec<(Duration, Vec<u8>)>) {
        if replies.iter().all(|(delay, _payload)| delay.is_zero()) {
            for (_delay, payload) in replies {
                for subscriber in self.subscribers.values() {
                    let _ = subscriber.send(payload.clone());
                }
            }
            return;
        }

        let started = Instant::now();
        for subscriber in self.subscribers.values() {
            let subscriber = subscriber.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                for (delay, payload) in replies {
                    sleep_until(started + delay).await;
                    let _ = subscriber.send(payload);
                }
            });
        }
    }
}

#[derive(Debug)]
struct FakeLink {
    state: Arc<Mutex<FakeDeviceState>>,
}

#[async_trait]
impl BleLink for FakeLink {
    async fn services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        let state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        Ok(state.services.clone())
    }

    async fn write(&self, uuid: &str, payload: &[u8], _mode: WriteMode) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if !has_characteristic(&state.services, uuid) {
            return Err(LinkError::UnknownCharacteristic {
                uuid: uuid.to_string(),
            });
        }

        state.writes.push(payload.to_vec());
        let replies = state.respond_to(payload);
        debug!(replies = replies.len(), "fake printer handled write");
        state.notify_all(replies);
        Ok(())
    }

    async fn subscribe(&self, uuid: &str) -> Result<NotificationStream, LinkError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if !has_characteristic(&state.services, uuid) {
            return Err(LinkError::UnknownCharacteristic {
                uuid: uuid.to_string(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.insert(uuid.to_ascii_lowercase(), sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
        }
        state.subscribers.clear();
        Ok(())
    }
}

fn lock(state: &Mutex<FakeDeviceState>) -> MutexGuard<'_, FakeDeviceState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn has_characteristic(services: &[ServiceInfo], uuid: &str) -> bool {
    services
        .iter()
        .any(|service| service.characteristic(uuid).is_some())
}

fn default_services(profile: &ProtocolProfile) -> Vec<ServiceInfo> {
    let Some(candidate) = profile.endpoint_candidates().first() else {
        return Vec::new();
    };

    let mut characteristics = vec![CharacteristicInfo::new(
        candidate.write_uuid().to_string(),
        vec!["write".to_string(), "write_without_response".to_string()],
    )];
    if let Some(notify_uuid) = candidate.notify_uuid() {
        characteristics.push(CharacteristicInfo::new(
            notify_uuid.to_string(),
            vec!["notify".to_string()],
        ));
    }

    vec![ServiceInfo::new(
        candidate.service_uuid().to_string(),
        characteristics,
    )]
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<DeviceHandle>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<DeviceHandle, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let name = if fields[1] == "-" {
        None
    } else {
        Some(fields[1].to_string())
    };
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };

    Ok(DeviceHandle::new(
        format!("fake:{}", fields[0]),
        fields[0].to_string(),
        name,
        rssi,
    ))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio_stream::StreamExt;

    use super::*;

    #[rstest]
    #[case("AA:BB:CC:DD:EE:01|PeriPage_A6|-43", 1)]
    #[case("AA:BB:CC:DD:EE:01|PeriPage_A6|-43;AA:BB:CC:DD:EE:02|-|-", 2)]
    fn parse_scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let devices = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, devices.len());
    }

    #[rstest]
    #[case("", FixtureError::EmptyFixture)]
    #[case("AA:BB|PeriPage_A6", FixtureError::InvalidRecordFieldCount)]
    #[case("AA:BB||-40", FixtureError::EmptyRecordField)]
    fn parse_scan_fixture_rejects_malformed_records(
        #[case] fixture: &str,
        #[case] expected: FixtureError,
    ) {
        let error = parse_scan_fixture(fixture).expect_err("fixture should be rejected");
        assert_eq!(expected.to_string(), error.to_string());
    }

    #[test]
    fn parse_scan_fixture_rejects_invalid_rssi() {
        let result = parse_scan_fixture("AA:BB|PeriPage_A6|loud");
        assert_matches!(result, Err(FixtureError::InvalidRssi(_)));
    }

    #[test]
    fn hex_payload_ignores_whitespace() {
        let payload: HexPayload = "10 ff 40".parse().expect("hex should parse");
        assert_eq!(vec![0x10, 0xFF, 0x40], Vec::<u8>::from(payload));
    }

    #[tokio::test]
    async fn link_answers_final_init_command_with_ready_response() {
        let config = FakeBackendConfig::single_device("AA:BB|PeriPage_A6|-40")
            .expect("fixture should parse");
        let adapter = FakeBleAdapter::new(config);
        let profile = ProtocolProfile::peripage_a6();
        let candidate = &profile.endpoint_candidates()[0];
        let device = adapter.devices[0].clone();

        let link = adapter.connect(&device).await.expect("connect should succeed");
        let mut notifications = link
            .subscribe(candidate.notify_uuid().expect("candidate declares notify"))
            .await
            .expect("subscribe should succeed");
        for command in profile.init_commands() {
            link.write(candidate.write_uuid(), command, WriteMode::WithoutResponse)
                .await
                .expect("write should succeed");
        }

        assert_eq!(Some(vec![0x10, 0xFF, 0x40]), notifications.next().await);
    }

    #[tokio::test]
    async fn dropped_link_rejects_writes() {
        let config = FakeBackendConfig::single_device("AA:BB|PeriPage_A6|-40")
            .expect("fixture should parse");
        let adapter = FakeBleAdapter::new(config);
        let device = adapter.devices[0].clone();
        let link = adapter.connect(&device).await.expect("connect should succeed");

        adapter.probe().drop_link();

        let result = link
            .write("0000ff02-0000-1000-8000-00805f9b34fb", &[0x00], WriteMode::WithoutResponse)
            .await;
        assert_eq!(Err(LinkError::Disconnected), result);
        assert!(!link.is_connected().await);
    }
}
