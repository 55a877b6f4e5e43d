use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_with::SerializeDisplay;
use tokio_stream::Stream;

use super::model::{DeviceHandle, ServiceInfo};
use crate::error::{DiscoveryError, LinkError};

/// Stream of raw notification payloads from one characteristic.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// GATT write mode for characteristic writes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display, SerializeDisplay)]
pub enum WriteMode {
    #[display("with_response")]
    WithResponse,
    #[display("without_response")]
    WithoutResponse,
}

/// Radio adapter able to scan for and connect to peripherals.
///
/// Scanning is poll-based: after `start_scan`, each `scan_tick` returns the
/// advertisements observed so far.
#[async_trait]
pub trait BleAdapter: Send + Sync + fmt::Debug {
    /// Starts listening for advertisements.
    async fn start_scan(&self) -> Result<(), DiscoveryError>;

    /// Returns the devices currently visible to the adapter, or `None` once
    /// the adapter has ended the scan on its own.
    async fn scan_tick(&self) -> Result<Option<Vec<DeviceHandle>>, DiscoveryError>;

    /// Stops listening for advertisements.
    async fn stop_scan(&self) -> Result<(), DiscoveryError>;

    /// Opens a link to a previously discovered device.
    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn BleLink>, LinkError>;
}

/// An open link to one peripheral.
#[async_trait]
pub trait BleLink: Send + Sync + fmt::Debug {
    /// Returns the discovered GATT services.
    async fn services(&self) -> Result<Vec<ServiceInfo>, LinkError>;

    /// Writes `payload` to a characteristic.
    async fn write(&self, uuid: &str, payload: &[u8], mode: WriteMode) -> Result<(), LinkError>;

    /// Subscribes to a notify/indicate characteristic.
    async fn subscribe(&self, uuid: &str) -> Result<NotificationStream, LinkError>;

    /// Returns whether the peripheral is still connected.
    async fn is_connected(&self) -> bool;

    /// Closes the link.
    async fn disconnect(&self) -> Result<(), LinkError>;
}
