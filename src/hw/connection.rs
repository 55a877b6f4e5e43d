use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::adapter::{BleAdapter, BleLink};
use super::model::DeviceHandle;
use crate::error::{ConnectionError, LinkError};
use crate::utils::duration_millis;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(4);

/// Bounds for establishing a link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Builder)]
pub struct ConnectPolicy {
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    /// Extra attempts after the first one fails.
    #[builder(default = DEFAULT_CONNECT_RETRIES)]
    connect_retries: u32,
    #[builder(default = INITIAL_BACKOFF)]
    initial_backoff: Duration,
    #[builder(default = MAX_BACKOFF)]
    max_backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConnectPolicy {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn connect_retries(&self) -> u32 {
        self.connect_retries
    }

    /// Returns the delay before retry number `retry` (starting at 1).
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use peripage::ConnectPolicy;
    ///
    /// let policy = ConnectPolicy::default();
    /// assert_eq!(Duration::from_millis(250), policy.backoff_for(1));
    /// assert_eq!(Duration::from_millis(500), policy.backoff_for(2));
    /// assert_eq!(Duration::from_secs(4), policy.backoff_for(12));
    /// ```
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// A live link to the printer.
///
/// Dropping an open connection schedules a disconnect on the current runtime.
pub struct Connection {
    device: DeviceHandle,
    link: Arc<dyn BleLink>,
    open: bool,
}

impl Connection {
    pub(crate) fn new(device: DeviceHandle, link: Arc<dyn BleLink>) -> Self {
        Self {
            device,
            link,
            open: true,
        }
    }

    /// Returns the connected device.
    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub(crate) fn link(&self) -> &dyn BleLink {
        self.link.as_ref()
    }

    /// Returns whether the peripheral still reports the link as up.
    pub async fn is_alive(&self) -> bool {
        self.open && self.link.is_connected().await
    }

    /// Closes the link.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the peripheral could not be disconnected
    /// cleanly. The connection is released either way.
    #[instrument(skip(self), level = "debug", fields(address = self.device.address()))]
    pub async fn disconnect(mut self) -> Result<(), LinkError> {
        self.open = false;
        self.link.disconnect().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.device)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        let link = Arc::clone(&self.link);
        let address = self.device.address().to_string();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(error) = link.disconnect().await {
                        debug!(%address, ?error, "disconnect on drop failed");
                    }
                });
            }
            Err(_) => warn!(%address, "connection dropped outside a runtime; link left open"),
        }
    }
}

#[derive(Debug)]
enum AttemptFailure {
    TimedOut,
    Refused(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out"),
            Self::Refused(detail) => write!(f, "refused: {detail}"),
        }
    }
}

impl AttemptFailure {
    fn into_error(self, device: &DeviceHandle, policy: &ConnectPolicy, attempts: u32) -> ConnectionError {
        match self {
            Self::TimedOut => ConnectionError::Timeout {
                device: device.label().to_string(),
                timeout_ms: duration_millis(policy.connect_timeout),
                attempts,
            },
            Self::Refused(detail) => ConnectionError::Refused {
                device: device.label().to_string(),
                detail,
                attempts,
            },
        }
    }
}

/// Opens a link to `device`, retrying failed attempts with exponential backoff.
///
/// Each attempt is bounded by the policy's connect timeout. Cancellation stops
/// further retries and reports the last failure.
///
/// # Errors
///
/// Returns [`ConnectionError::Timeout`] or [`ConnectionError::Refused`] for the
/// final failed attempt, carrying the number of attempts made.
#[instrument(
    skip(adapter, device, cancel),
    level = "debug",
    fields(address = device.address(), retries = policy.connect_retries)
)]
pub async fn connect(
    adapter: &dyn BleAdapter,
    device: &DeviceHandle,
    policy: &ConnectPolicy,
    cancel: &CancellationToken,
) -> Result<Connection, ConnectionError> {
    let max_attempts = policy.connect_retries.saturating_add(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let failure = match timeout(policy.connect_timeout, adapter.connect(device)).await {
            Ok(Ok(link)) => {
                info!(attempt, "connected to printer");
                return Ok(Connection::new(device.clone(), link));
            }
            Ok(Err(error)) => AttemptFailure::Refused(error.to_string()),
            Err(_elapsed) => AttemptFailure::TimedOut,
        };

        if attempt >= max_attempts {
            return Err(failure.into_error(device, policy, attempt));
        }

        let backoff = policy.backoff_for(attempt);
        warn!(
            attempt,
            %failure,
            backoff_ms = duration_millis(backoff),
            "connect attempt failed; retrying"
        );
        tokio::select! {
            () = cancel.cancelled() => return Err(failure.into_error(device, policy, attempt)),
            () = sleep(backoff) => {}
        }
    }
}
