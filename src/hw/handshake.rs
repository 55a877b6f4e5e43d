use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument};

use super::adapter::{NotificationStream, WriteMode};
use super::connection::Connection;
use super::model::{DeviceHandle, ServiceInfo};
use crate::error::{ConnectionError, HandshakeError, LinkError, PrinterError};
use crate::protocol::ProtocolProfile;
use crate::utils::duration_millis;

/// Characteristics selected for a printer session.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct SessionEndpoints {
    service_uuid: String,
    write_uuid: String,
    notify_uuid: Option<String>,
}

impl SessionEndpoints {
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

/// A connection that completed the printer handshake.
pub struct ReadySession {
    connection: Connection,
    endpoints: SessionEndpoints,
    write_mode: WriteMode,
    notifications: Option<Mutex<NotificationStream>>,
}

impl fmt::Debug for ReadySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadySession")
            .field("connection", &self.connection)
            .field("endpoints", &self.endpoints)
            .field("write_mode", &self.write_mode)
            .field("subscribed", &self.notifications.is_some())
            .finish()
    }
}

impl ReadySession {
    /// Returns the connected device.
    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        self.connection.device()
    }

    /// Returns the negotiated endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &SessionEndpoints {
        &self.endpoints
    }

    /// Returns whether the link is still up.
    pub async fn is_alive(&self) -> bool {
        self.connection.is_alive().await
    }

    /// Closes the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the peripheral could not be disconnected
    /// cleanly.
    pub async fn disconnect(self) -> Result<(), LinkError> {
        self.connection.disconnect().await
    }

    pub(crate) async fn write(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.connection
            .link()
            .write(&self.endpoints.write_uuid, payload, self.write_mode)
            .await
    }

    pub(crate) fn notifications(&mut self) -> Option<&mut NotificationStream> {
        self.notifications
            .as_mut()
            .map(|stream| stream.get_mut().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Initialises a connected printer.
///
/// Selects the first endpoint candidate the device fully supports, subscribes
/// to its notify characteristic, sends the init commands in order and checks
/// the ready response. The whole exchange is bounded by `handshake_timeout`.
/// On failure the connection is closed before the error is returned.
///
/// # Errors
///
/// Returns a [`HandshakeError`] for missing endpoints, a rejected command, an
/// unexpected ready response or a timeout, and
/// [`ConnectionError::Dropped`] if the link goes away mid-handshake.
#[instrument(
    skip(connection, profile),
    level = "debug",
    fields(profile = profile.name(), address = connection.device().address())
)]
pub async fn handshake(
    connection: Connection,
    profile: &ProtocolProfile,
    handshake_timeout: Duration,
) -> Result<ReadySession, PrinterError> {
    let outcome = match timeout(handshake_timeout, initialise(&connection, profile)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => Err(HandshakeError::Timeout {
            timeout_ms: duration_millis(handshake_timeout),
        }
        .into()),
    };

    match outcome {
        Ok((endpoints, notifications)) => {
            info!(
                service = endpoints.service_uuid(),
                write = endpoints.write_uuid(),
                notify = endpoints.notify_uuid().unwrap_or("-"),
                "printer ready"
            );
            Ok(ReadySession {
                connection,
                endpoints,
                write_mode: profile.write_mode(),
                notifications: notifications.map(Mutex::new),
            })
        }
        Err(error) => {
            debug!(%error, "handshake failed; disconnecting");
            if let Err(disconnect_error) = connection.disconnect().await {
                debug!(?disconnect_error, "failed to disconnect after handshake failure");
            }
            Err(error)
        }
    }
}

async fn initialise(
    connection: &Connection,
    profile: &ProtocolProfile,
) -> Result<(SessionEndpoints, Option<NotificationStream>), PrinterError> {
    let link = connection.link();
    let services = link.services().await.map_err(dropped)?;
    let endpoints = negotiate_endpoints(&services, profile)?;

    let mut notifications = match endpoints.notify_uuid() {
        Some(notify_uuid) => Some(link.subscribe(notify_uuid).await.map_err(|error| {
            link_failure(error, |_| HandshakeError::CharacteristicNotFound {
                service: endpoints.service_uuid.clone(),
                characteristic: notify_uuid.to_string(),
            })
        })?),
        None => None,
    };

    for (index, command) in profile.init_commands().iter().enumerate() {
        link.write(&endpoints.write_uuid, command, profile.write_mode())
            .await
            .map_err(|error| {
                link_failure(error, |detail| HandshakeError::CommandFailed { index, detail })
            })?;
    }

    if let (Some(pattern), Some(stream)) = (profile.ready_pattern(), notifications.as_mut()) {
        let Some(response) = stream.next().await else {
            return Err(ConnectionError::Dropped {
                detail: "notification stream closed during handshake".to_string(),
            }
            .into());
        };
        if !pattern.matches(&response) {
            return Err(HandshakeError::UnexpectedResponse { raw: response }.into());
        }
    }

    Ok((endpoints, notifications))
}

#[instrument(skip(services, profile), level = "debug", fields(service_count = services.len()))]
fn negotiate_endpoints(
    services: &[ServiceInfo],
    profile: &ProtocolProfile,
) -> Result<SessionEndpoints, HandshakeError> {
    let mut first_missing: Option<HandshakeError> = None;

    for candidate in profile.endpoint_candidates() {
        let Some(service) = services
            .iter()
            .find(|service| service.uuid().eq_ignore_ascii_case(candidate.service_uuid()))
        else {
            continue;
        };

        let missing = |characteristic: &str| HandshakeError::CharacteristicNotFound {
            service: candidate.service_uuid().to_string(),
            characteristic: characteristic.to_string(),
        };

        if !service
            .characteristic(candidate.write_uuid())
            .is_some_and(|characteristic| characteristic.supports_write())
        {
            first_missing.get_or_insert_with(|| missing(candidate.write_uuid()));
            continue;
        }

        if let Some(notify_uuid) = candidate.notify_uuid()
            && !service
                .characteristic(notify_uuid)
                .is_some_and(|characteristic| characteristic.supports_notify())
        {
            first_missing.get_or_insert_with(|| missing(notify_uuid));
            continue;
        }

        return Ok(SessionEndpoints {
            service_uuid: candidate.service_uuid().to_string(),
            write_uuid: candidate.write_uuid().to_string(),
            notify_uuid: candidate.notify_uuid().map(ToString::to_string),
        });
    }

    Err(first_missing.unwrap_or_else(|| HandshakeError::ServiceNotFound {
        candidates: profile
            .endpoint_candidates()
            .iter()
            .map(|candidate| candidate.service_uuid())
            .collect::<Vec<_>>()
            .join(", "),
    }))
}

fn dropped(error: LinkError) -> PrinterError {
    ConnectionError::Dropped {
        detail: error.to_string(),
    }
    .into()
}

fn link_failure(error: LinkError, other: impl FnOnce(String) -> HandshakeError) -> PrinterError {
    match error {
        LinkError::Disconnected => dropped(error),
        error => other(error.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::hw::model::CharacteristicInfo;
    use crate::hw::{ConnectPolicy, FakeBackendConfig, FakeBleAdapter, connect};

    const FIXTURE: &str = "AA:BB:CC:DD:EE:01|PeriPage_A6|-40";

    fn service(uuid: &str, characteristics: &[(&str, &[&str])]) -> ServiceInfo {
        ServiceInfo::new(
            uuid.to_string(),
            characteristics
                .iter()
                .map(|(uuid, properties)| {
                    CharacteristicInfo::new(
                        (*uuid).to_string(),
                        properties.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
        )
    }

    async fn connected(adapter: &FakeBleAdapter) -> Connection {
        let device = DeviceHandle::new(
            "fake:AA".to_string(),
            "AA:BB:CC:DD:EE:01".to_string(),
            Some("PeriPage_A6".to_string()),
            Some(-40),
        );
        connect(adapter, &device, &ConnectPolicy::default(), &CancellationToken::new())
            .await
            .expect("connect should succeed")
    }

    #[tokio::test]
    async fn handshake_negotiates_first_candidate_and_sends_init_commands() {
        let adapter = FakeBleAdapter::new(
            FakeBackendConfig::single_device(FIXTURE).expect("fixture should parse"),
        );
        let profile = ProtocolProfile::peripage_a6();

        let session = handshake(connected(&adapter).await, &profile, Duration::from_secs(2))
            .await
            .expect("handshake should succeed");

        assert_eq!(
            "0000ff02-0000-1000-8000-00805f9b34fb",
            session.endpoints().write_uuid()
        );
        assert_eq!(profile.init_commands().to_vec(), adapter.probe().writes());
    }

    #[tokio::test]
    async fn handshake_falls_back_to_later_candidate() {
        let services = vec![service(
            "0000AE30-0000-1000-8000-00805F9B34FB",
            &[
                ("0000ae01-0000-1000-8000-00805f9b34fb", &["write_without_response"]),
                ("0000ae02-0000-1000-8000-00805f9b34fb", &["indicate"]),
            ],
        )];
        let adapter = FakeBleAdapter::new(
            FakeBackendConfig::builder()
                .scan_fixture(FIXTURE.parse().expect("fixture should parse"))
                .services(services)
                .build(),
        );

        let session = handshake(
            connected(&adapter).await,
            &ProtocolProfile::peripage_a6(),
            Duration::from_secs(2),
        )
        .await
        .expect("handshake should succeed");

        assert_eq!(
            "0000ae30-0000-1000-8000-00805f9b34fb",
            session.endpoints().service_uuid()
        );
    }

    #[test]
    fn negotiate_reports_missing_services() {
        let services = vec![service("0000180a-0000-1000-8000-00805f9b34fb", &[])];

        let error = negotiate_endpoints(&services, &ProtocolProfile::peripage_a6())
            .expect_err("no candidate should match");

        assert_matches!(error, HandshakeError::ServiceNotFound { candidates } if candidates.contains("0000ff00"));
    }

    #[test]
    fn negotiate_rejects_write_characteristic_without_write_property() {
        let services = vec![service(
            "0000ff00-0000-1000-8000-00805f9b34fb",
            &[
                ("0000ff02-0000-1000-8000-00805f9b34fb", &["read"]),
                ("0000ff01-0000-1000-8000-00805f9b34fb", &["notify"]),
            ],
        )];

        let error = negotiate_endpoints(&services, &ProtocolProfile::peripage_a6())
            .expect_err("write characteristic is read-only");

        assert_eq!(
            HandshakeError::CharacteristicNotFound {
                service: "0000ff00-0000-1000-8000-00805f9b34fb".to_string(),
                characteristic: "0000ff02-0000-1000-8000-00805f9b34fb".to_string(),
            },
            error
        );
    }

    #[tokio::test]
    async fn unexpected_ready_response_carries_raw_bytes_and_disconnects() {
        let adapter = FakeBleAdapter::new(
            FakeBackendConfig::builder()
                .scan_fixture(FIXTURE.parse().expect("fixture should parse"))
                .ready_response("EE01".parse().expect("hex should parse"))
                .build(),
        );

        let error = handshake(
            connected(&adapter).await,
            &ProtocolProfile::peripage_a6(),
            Duration::from_secs(2),
        )
        .await
        .expect_err("ready response should be rejected");

        assert_eq!(
            PrinterError::from(HandshakeError::UnexpectedResponse {
                raw: vec![0xEE, 0x01]
            }),
            error
        );
        assert!(!adapter.probe().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_printer_times_out() {
        let adapter = FakeBleAdapter::new(
            FakeBackendConfig::builder()
                .scan_fixture(FIXTURE.parse().expect("fixture should parse"))
                .ready_response("".parse().expect("hex should parse"))
                .build(),
        );

        let error = handshake(
            connected(&adapter).await,
            &ProtocolProfile::peripage_a6(),
            Duration::from_millis(500),
        )
        .await
        .expect_err("handshake should time out");

        assert_eq!(
            PrinterError::from(HandshakeError::Timeout { timeout_ms: 500 }),
            error
        );
        assert_eq!(1, adapter.probe().disconnects());
    }
}
