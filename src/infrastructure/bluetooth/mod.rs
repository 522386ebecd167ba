//! Bluetooth Module
//!
//! The peripheral-handle seam between streaming sessions and a BLE stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   StreamingSession                       │
//! │      (decode + dispatch, owns one Peripheral)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Peripheral trait
//!         ┌─────────────┴─────────────┐
//!         │                           │
//!         ▼                           ▼
//! ┌────────────────┐         ┌─────────────────┐
//! │   Simulated    │         │    Btleplug     │
//! │                │         │                 │
//! │ - in-process   │         │ - scanning      │
//! │ - scripted     │         │ - GATT access   │
//! │   failures     │         │ - notification  │
//! │ - mock sensor  │         │   pump          │
//! └────────────────┘         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`simulated`] - In-process peripheral for tests and demos
//! - `central` - Real adapters via btleplug (feature `ble-central`)

#[cfg(feature = "ble-central")]
pub mod central;
pub mod simulated;

use crate::domain::models::{Notification, PeripheralIdentity};
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

pub use simulated::{spawn_mock_sensor, SimulatedPeripheral};

/// Called once per notification, in arrival order, on the transport's
/// delivery path.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// A handle to one discovered BLE peripheral.
#[async_trait]
pub trait Peripheral: Send + Sync {
    fn identity(&self) -> &PeripheralIdentity;

    async fn connect(&self) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic`, routing them to `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
