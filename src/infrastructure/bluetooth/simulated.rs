//! In-process BLE peripheral
//!
//! Stands in for a real heart-rate strap: records every GATT operation a
//! session performs and lets the caller push notifications, which are
//! delivered synchronously to the subscribed handler. Clones share state, so
//! a test can keep one clone while a session owns another.
//!
//! [`spawn_mock_sensor`] turns a simulated peripheral into a live-looking
//! strap that emits heart beats and accelerometer frames on its own.

use super::{NotificationHandler, Peripheral};
use crate::domain::models::{GattWrite, Notification, PeripheralIdentity, Timestamp};
use crate::error::TransportError;
use crate::protocol::device_info::{BATTERY_LEVEL_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID};
use crate::protocol::heart_rate::HeartRateMeasurement;
use crate::protocol::mock_sensor::{self, MOCK_ACC_UUID};
use crate::protocol::HEART_RATE_MEASUREMENT_UUID;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// A GATT operation observed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedEvent {
    Connected,
    Subscribed(Uuid),
    Unsubscribed(Uuid),
    Read(Uuid),
    Written(GattWrite),
    Disconnected,
}

#[derive(Default)]
struct State {
    connected: bool,
    handlers: HashMap<Uuid, NotificationHandler>,
    values: HashMap<Uuid, Vec<u8>>,
    events: Vec<SimulatedEvent>,
    connect_failure: Option<String>,
    subscribe_failures: HashSet<Uuid>,
}

#[derive(Clone)]
pub struct SimulatedPeripheral {
    identity: PeripheralIdentity,
    state: Arc<Mutex<State>>,
}

impl SimulatedPeripheral {
    pub fn new(identity: PeripheralIdentity) -> Self {
        Self {
            identity,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn named(name: &str) -> Self {
        Self::new(PeripheralIdentity::new(name, "SIM:00:00:00:00:01"))
    }

    /// A mock strap named `Mock Sensor <id>` with its device information
    /// filled in. Pair it with [`spawn_mock_sensor`] for live traffic.
    pub fn mock_sensor(id: &str) -> Self {
        let peripheral = Self::new(PeripheralIdentity::new(
            format!("Mock Sensor {id}"),
            "SIM:00:00:00:00:99",
        ));
        peripheral.set_value(MODEL_NUMBER_UUID, "Mock");
        peripheral.set_value(MANUFACTURER_NAME_UUID, "Mock sensor ltd");
        peripheral.set_value(BATTERY_LEVEL_UUID, [99]);
        peripheral
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) {
        self.lock().values.insert(characteristic, value.into());
    }

    /// Make the next `connect` calls fail with `reason`.
    pub fn fail_connect(&self, reason: impl Into<String>) {
        self.lock().connect_failure = Some(reason.into());
    }

    /// Make subscriptions to `characteristic` fail.
    pub fn fail_subscribe(&self, characteristic: Uuid) {
        self.lock().subscribe_failures.insert(characteristic);
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn subscribed(&self) -> BTreeSet<Uuid> {
        self.lock().handlers.keys().copied().collect()
    }

    pub fn events(&self) -> Vec<SimulatedEvent> {
        self.lock().events.clone()
    }

    pub fn writes(&self) -> Vec<GattWrite> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimulatedEvent::Written(w) => Some(w.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver a notification now. Returns false if nothing is subscribed.
    pub fn notify(&self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> bool {
        self.deliver(Notification::new(characteristic, value))
    }

    pub fn notify_at(
        &self,
        characteristic: Uuid,
        value: impl Into<Vec<u8>>,
        received_at: Timestamp,
    ) -> bool {
        self.deliver(Notification::new(characteristic, value).at(received_at))
    }

    /// Emit a Heart Rate Measurement carrying `rr_intervals` (1/1024 s units).
    pub fn notify_heart_rate(&self, bpm: u16, rr_intervals: &[u16]) -> bool {
        let payload = HeartRateMeasurement {
            bpm,
            energy_expended: None,
            rr_intervals: rr_intervals.to_vec(),
        }
        .to_bytes();
        self.notify(HEART_RATE_MEASUREMENT_UUID, payload)
    }

    fn deliver(&self, notification: Notification) -> bool {
        let handler = {
            let state = self.lock();
            if !state.connected {
                return false;
            }
            state.handlers.get(&notification.characteristic).cloned()
        };
        match handler {
            Some(handler) => {
                trace!(
                    "Simulated notification on {}: {:02X?}",
                    notification.characteristic,
                    notification.value
                );
                handler(notification);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Peripheral for SimulatedPeripheral {
    fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(reason) = &state.connect_failure {
            return Err(TransportError::Other(reason.clone()));
        }
        state.connected = true;
        state.events.push(SimulatedEvent::Connected);
        debug!("Simulated peripheral {} connected", self.identity.address);
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.subscribe_failures.contains(&characteristic) {
            return Err(TransportError::Other("subscription rejected".to_string()));
        }
        state.handlers.insert(characteristic, handler);
        state.events.push(SimulatedEvent::Subscribed(characteristic));
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.handlers.remove(&characteristic).is_none() {
            return Err(TransportError::CharacteristicNotFound(characteristic));
        }
        state.events.push(SimulatedEvent::Unsubscribed(characteristic));
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let value = state
            .values
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))?;
        state.events.push(SimulatedEvent::Read(characteristic));
        Ok(value)
    }

    async fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state
            .events
            .push(SimulatedEvent::Written(GattWrite::new(characteristic, value)));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connected = false;
        state.handlers.clear();
        state.events.push(SimulatedEvent::Disconnected);
        Ok(())
    }
}

const MOCK_ACC_PERIOD: Duration = Duration::from_millis(10);

/// Drive `peripheral` like a live mock strap: a heart beat every 0.8 to 1.3 s
/// carrying the RR interval in milliseconds, and a 2 Hz sine on the
/// accelerometer every 10 ms. Runs until the peripheral disconnects after
/// having been connected.
pub fn spawn_mock_sensor(peripheral: SimulatedPeripheral) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut ticker = tokio::time::interval(MOCK_ACC_PERIOD);
        let started = Instant::now();
        let mut next_beat: Option<Instant> = None;
        let mut was_connected = false;

        loop {
            ticker.tick().await;
            let connected = peripheral.is_connected();
            if was_connected && !connected {
                break;
            }
            if !connected {
                continue;
            }
            was_connected = true;

            let now = Instant::now();
            let phase = TAU * 2.0 * (now - started).as_secs_f64();
            peripheral.notify(
                MOCK_ACC_UUID,
                mock_sensor::acc_payload(
                    phase.sin() as f32,
                    phase.cos() as f32,
                    rng.gen_range(-0.1..0.1),
                ),
            );

            let beat_due = next_beat.map_or(true, |at| now >= at);
            if beat_due {
                let rr_ms: u16 = rng.gen_range(800..=1300);
                peripheral.notify_heart_rate(60_000 / rr_ms, &[rr_ms]);
                next_beat = Some(now + Duration::from_millis(rr_ms.into()));
            }
        }
        info!("Mock sensor {} stopped", peripheral.identity.address);
    })
}
