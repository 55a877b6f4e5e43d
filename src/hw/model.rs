use std::fmt;

use serde::Serialize;
use time::OffsetDateTime;

/// A discovered BLE peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct DeviceHandle {
    device_id: String,
    address: String,
    name: Option<String>,
    rssi: Option<i16>,
    #[serde(with = "time::serde::rfc3339")]
    discovered_at: OffsetDateTime,
}

impl DeviceHandle {
    /// Creates a discovered-device record stamped with the current time.
    pub(crate) fn new(
        device_id: String,
        address: String,
        name: Option<String>,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            device_id,
            address,
            name,
            rssi,
            discovered_at: OffsetDateTime::now_utc(),
        }
    }

    /// Returns the backend-specific device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the hardware address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the observed RSSI value, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns when the advertisement was observed.
    #[must_use]
    pub fn discovered_at(&self) -> OffsetDateTime {
        self.discovered_at
    }

    /// Returns the name when advertised, otherwise the address.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }
}

/// A characteristic description discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicInfo {
    uuid: String,
    properties: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description.
    pub(crate) fn new(uuid: String, properties: Vec<String>) -> Self {
        Self { uuid, properties }
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns property labels for this characteristic.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub(crate) fn has_property(&self, property: &str) -> bool {
        self.properties
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(property))
    }

    pub(crate) fn supports_write(&self) -> bool {
        self.has_property("write") || self.has_property("write_without_response")
    }

    pub(crate) fn supports_notify(&self) -> bool {
        self.has_property("notify") || self.has_property("indicate")
    }
}

/// A GATT service with discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    uuid: String,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Creates a service description.
    pub(crate) fn new(uuid: String, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns all characteristics in this service.
    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }

    pub(crate) fn characteristic(&self, uuid: &str) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
    }
}

/// Predicate selecting the printer among advertisements.
///
/// Names match exactly; addresses match case-insensitively.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeviceFilter {
    Name(String),
    Address(String),
}

impl DeviceFilter {
    /// Returns whether a discovered device satisfies this filter.
    ///
    /// ```
    /// use peripage::DeviceFilter;
    ///
    /// assert!(matches!(DeviceFilter::from("aa:bb:cc:dd:ee:ff"), DeviceFilter::Address(_)));
    /// assert!(matches!(DeviceFilter::from("PeriPage_A6"), DeviceFilter::Name(_)));
    /// ```
    #[must_use]
    pub fn matches(&self, device: &DeviceHandle) -> bool {
        match self {
            Self::Name(name) => device.name() == Some(name.as_str()),
            Self::Address(address) => device.address().eq_ignore_ascii_case(address),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Name(value) | Self::Address(value) => value.trim().is_empty(),
        }
    }
}

impl From<&str> for DeviceFilter {
    fn from(value: &str) -> Self {
        if looks_like_address(value) {
            Self::Address(value.to_string())
        } else {
            Self::Name(value.to_string())
        }
    }
}

impl From<String> for DeviceFilter {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name={name}"),
            Self::Address(address) => write!(f, "address={address}"),
        }
    }
}

fn looks_like_address(value: &str) -> bool {
    let octets: Vec<&str> = value.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|ch| ch.is_ascii_hexdigit()))
}
