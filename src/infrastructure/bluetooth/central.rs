//! btleplug-backed scanning and peripheral handles.
//!
//! Each connected peripheral gets one tokio task that drains the btleplug
//! notification stream and calls the handler registered for the
//! characteristic, so notifications are handled one at a time in arrival
//! order.

use super::{NotificationHandler, Peripheral};
use crate::domain::models::{Notification, PeripheralIdentity};
use crate::error::TransportError;
use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Handlers = Arc<Mutex<HashMap<Uuid, NotificationHandler>>>;

/// First available BLE adapter.
pub struct BtleplugCentral {
    adapter: Adapter,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Other("No Bluetooth adapter found".to_string()))?;
        Ok(Self { adapter })
    }

    /// Scan for `duration` and return every peripheral seen.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<BtleplugPeripheral>, TransportError> {
        info!("Scanning for BLE peripherals for {:?}...", duration);
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let properties = peripheral.properties().await?.unwrap_or_default();
            let identity = PeripheralIdentity {
                name: properties.local_name,
                address: properties.address.to_string(),
                services: properties.services.into_iter().collect(),
            };
            debug!("Found {} ({})", identity.display_name(), identity.address);
            found.push(BtleplugPeripheral::new(identity, peripheral));
        }
        info!("Scan complete: {} peripherals", found.len());
        Ok(found)
    }
}

pub struct BtleplugPeripheral {
    identity: PeripheralIdentity,
    peripheral: btleplug::platform::Peripheral,
    handlers: Handlers,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugPeripheral {
    fn new(identity: PeripheralIdentity, peripheral: btleplug::platform::Peripheral) -> Self {
        Self {
            identity,
            peripheral,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            pump: Mutex::new(None),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, NotificationHandler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_pump(&self) {
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

#[async_trait]
impl Peripheral for BtleplugPeripheral {
    fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.peripheral.connect().await?;
        self.peripheral.discover_services().await?;
        info!(
            "Connected to {}, {} characteristics",
            self.identity.display_name(),
            self.peripheral.characteristics().len()
        );

        let mut notifications = self.peripheral.notifications().await?;
        let handlers = Arc::clone(&self.handlers);
        let pump = tokio::spawn(async move {
            while let Some(value) = notifications.next().await {
                let handler = handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&value.uuid)
                    .cloned();
                match handler {
                    Some(handler) => handler(Notification::new(value.uuid, value.value)),
                    None => debug!("Notification from unsubscribed {}", value.uuid),
                }
            }
            debug!("Notification stream ended");
        });
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.handlers().insert(characteristic, handler);
        if let Err(e) = self.peripheral.subscribe(&target).await {
            self.handlers().remove(&characteristic);
            return Err(e.into());
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.handlers().remove(&characteristic);
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let target = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&target).await?)
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_pump();
        self.handlers().clear();
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {}", self.identity.address, e);
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for BtleplugPeripheral {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
