use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument};

use super::adapter::{BleAdapter, BleLink, NotificationStream, WriteMode};
use super::model::{CharacteristicInfo, DeviceHandle, ServiceInfo};
use crate::error::{DiscoveryError, LinkError};

/// BLE adapter backed by `btleplug`, scanning on every local radio.
#[derive(Debug)]
pub struct BtleplugAdapter {
    adapters: Vec<Adapter>,
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugAdapter {
    /// Opens the platform BLE manager and its adapters.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::AdapterUnavailable`] when the platform stack
    /// cannot be opened or no adapter is present.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<Self, DiscoveryError> {
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapters = manager.adapters().await.map_err(unavailable)?;
        if adapters.is_empty() {
            return Err(DiscoveryError::AdapterUnavailable {
                detail: "no Bluetooth adapters found".to_string(),
            });
        }

        info!(adapter_count = adapters.len(), "opened BLE adapters");
        Ok(Self {
            adapters,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    fn peripherals(&self) -> MutexGuard<'_, HashMap<String, Peripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self) -> Result<(), DiscoveryError> {
        for adapter in &self.adapters {
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn scan_tick(&self) -> Result<Option<Vec<DeviceHandle>>, DiscoveryError> {
        let mut devices = Vec::new();
        for adapter in &self.adapters {
            let peripherals = adapter.peripherals().await.map_err(unavailable)?;
            for peripheral in peripherals {
                let Some(properties) = peripheral.properties().await.map_err(unavailable)? else {
                    continue;
                };
                let device = device_from_properties(peripheral.id().to_string(), properties);
                self.peripherals()
                    .insert(device.device_id().to_string(), peripheral);
                devices.push(device);
            }
        }
        Ok(Some(devices))
    }

    async fn stop_scan(&self) -> Result<(), DiscoveryError> {
        for adapter in &self.adapters {
            adapter.stop_scan().await.map_err(unavailable)?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(address = device.address()))]
    async fn connect(&self, device: &DeviceHandle) -> Result<Arc<dyn BleLink>, LinkError> {
        let peripheral = self
            .peripherals()
            .get(device.device_id())
            .cloned()
            .ok_or_else(|| LinkError::Operation {
                detail: format!("device `{}` was not seen by this adapter", device.label()),
            })?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|characteristic| {
                (
                    characteristic.uuid.to_string().to_ascii_lowercase(),
                    characteristic,
                )
            })
            .collect();
        Ok(Arc::new(BtleplugLink {
            peripheral,
            characteristics,
        }))
    }
}

#[derive(Debug)]
struct BtleplugLink {
    peripheral: Peripheral,
    characteristics: HashMap<String, Characteristic>,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: &str) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .get(&uuid.to_ascii_lowercase())
            .ok_or_else(|| LinkError::UnknownCharacteristic {
                uuid: uuid.to_string(),
            })
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn services(&self) -> Result<Vec<ServiceInfo>, LinkError> {
        Ok(collect_services(&self.peripheral))
    }

    async fn write(&self, uuid: &str, payload: &[u8], mode: WriteMode) -> Result<(), LinkError> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral
            .write(characteristic, payload, write_type(mode))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, uuid: &str) -> Result<NotificationStream, LinkError> {
        let characteristic = self.characteristic(uuid)?.clone();
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        let expected = characteristic.uuid;
        Ok(Box::pin(
            notifications
                .filter(move |notification| notification.uuid == expected)
                .map(|notification| notification.value),
        ))
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), LinkError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        } else {
            debug!("peripheral already disconnected");
        }
        Ok(())
    }
}

fn unavailable(error: btleplug::Error) -> DiscoveryError {
    DiscoveryError::AdapterUnavailable {
        detail: error.to_string(),
    }
}

fn device_from_properties(device_id: String, properties: PeripheralProperties) -> DeviceHandle {
    DeviceHandle::new(
        device_id,
        properties.address.to_string(),
        properties.local_name,
        properties.rssi,
    )
}

fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

fn collect_services(peripheral: &Peripheral) -> Vec<ServiceInfo> {
    let mut services: Vec<ServiceInfo> = peripheral
        .services()
        .into_iter()
        .map(|service| {
            let mut characteristics: Vec<CharacteristicInfo> = service
                .characteristics
                .iter()
                .map(|characteristic| {
                    CharacteristicInfo::new(
                        characteristic.uuid.to_string().to_ascii_lowercase(),
                        property_labels(characteristic.properties),
                    )
                })
                .collect();
            characteristics.sort_by(|left, right| left.uuid().cmp(right.uuid()));
            ServiceInfo::new(service.uuid.to_string().to_ascii_lowercase(), characteristics)
        })
        .collect();
    services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    services
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}
