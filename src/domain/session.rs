//! Streaming Session
//!
//! Owns one peripheral handle and one decoder. Each subscribed
//! characteristic routes its notifications into [`dispatch_notification`],
//! which decodes and fans samples out to the callbacks registered for every
//! active stream kind that depends on that characteristic.
//!
//! ```text
//! Created ──connect──▶ Connected ──start_stream──▶ Streaming
//!    │                    │  ▲                        │
//!    │                    │  └──────stop_stream───────┘
//!    └────────────────────┴──────disconnect──────────────▶ Disconnected
//! ```

use crate::domain::decoder::DeviceDecoder;
use crate::domain::models::{
    DeviceInfo, DeviceType, Notification, PeripheralIdentity, SampleRecord, StreamKind, Timestamp,
};
use crate::error::{HrmError, Result, TransportError};
use crate::infrastructure::bluetooth::{NotificationHandler, Peripheral};
use crate::protocol::device_info::{self, BATTERY_LEVEL_UUID, MANUFACTURER_NAME_UUID, MODEL_NUMBER_UUID};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    Streaming,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Streaming => "streaming",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type CallbackFn = dyn Fn(&SampleRecord) -> anyhow::Result<()> + Send + Sync;

/// Consumer of decoded samples. Identity is by allocation: clones of one
/// callback count as the same registration.
#[derive(Clone)]
pub struct SampleCallback(Arc<CallbackFn>);

impl SampleCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&SampleRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a callback that cannot fail.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&SampleRecord) + Send + Sync + 'static,
    {
        Self::new(move |sample| {
            f(sample);
            Ok(())
        })
    }

    pub fn same_as(&self, other: &SampleCallback) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }

    fn invoke(&self, kind: StreamKind, sample: &SampleRecord) {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(sample))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} callback failed: {:#}", kind, e),
            Err(_) => warn!("{} callback panicked", kind),
        }
    }
}

impl fmt::Debug for SampleCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SampleCallback({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// One active stream kind: what it listens to and who receives its samples.
struct StreamSubscription {
    characteristics: BTreeSet<Uuid>,
    callbacks: Vec<SampleCallback>,
}

impl StreamSubscription {
    /// Deliver `samples` in order, never stamping one earlier than `last`.
    /// Returns the timestamp of the last sample delivered.
    fn deliver(
        &self,
        kind: StreamKind,
        samples: Vec<SampleRecord>,
        mut last: Option<Timestamp>,
    ) -> Option<Timestamp> {
        for mut sample in samples {
            if let Some(last) = last {
                if sample.timestamp() < last {
                    trace!(
                        "Clamping {} sample at {:.6} to previous {:.6}",
                        kind,
                        sample.timestamp(),
                        last
                    );
                    sample.set_timestamp(last);
                }
            }
            last = Some(sample.timestamp());
            for callback in &self.callbacks {
                callback.invoke(kind, &sample);
            }
        }
        last
    }
}

/// State shared with the notification path.
struct Dispatch {
    state: SessionState,
    streams: BTreeMap<StreamKind, StreamSubscription>,
    /// Latest timestamp delivered per kind; outlives stop/start of a stream.
    last_timestamps: BTreeMap<StreamKind, Timestamp>,
}

fn lock(dispatch: &Mutex<Dispatch>) -> MutexGuard<'_, Dispatch> {
    dispatch.lock().unwrap_or_else(|e| e.into_inner())
}

/// Decode one notification and deliver the result to every stream that
/// listens on its characteristic. Runs to completion under the dispatch lock,
/// so notifications are handled one at a time.
fn dispatch_notification(
    dispatch: &Mutex<Dispatch>,
    decoder: &dyn DeviceDecoder,
    notification: Notification,
) {
    let mut guard = lock(dispatch);
    if guard.state == SessionState::Disconnected {
        return;
    }
    let Dispatch {
        streams,
        last_timestamps,
        ..
    } = &mut *guard;

    let Notification {
        characteristic,
        value,
        received_at,
    } = notification;

    for (kind, stream) in streams
        .iter()
        .filter(|(_, s)| s.characteristics.contains(&characteristic))
    {
        match decoder.decode(*kind, characteristic, &value, received_at) {
            Ok(samples) => {
                let last = last_timestamps.get(kind).copied();
                if let Some(latest) = stream.deliver(*kind, samples, last) {
                    last_timestamps.insert(*kind, latest);
                }
            }
            Err(e) => {
                warn!("Dropping {} notification: {}", kind, e);
                trace!("Dropped payload: {:02X?}", value);
            }
        }
    }
}

pub struct StreamingSession {
    identity: PeripheralIdentity,
    peripheral: Option<Box<dyn Peripheral>>,
    decoder: Arc<dyn DeviceDecoder>,
    dispatch: Arc<Mutex<Dispatch>>,
    subscribed: BTreeSet<Uuid>,
}

impl StreamingSession {
    pub fn new(peripheral: Box<dyn Peripheral>, decoder: Box<dyn DeviceDecoder>) -> Self {
        Self {
            identity: peripheral.identity().clone(),
            peripheral: Some(peripheral),
            decoder: Arc::from(decoder),
            dispatch: Arc::new(Mutex::new(Dispatch {
                state: SessionState::Created,
                streams: BTreeMap::new(),
                last_timestamps: BTreeMap::new(),
            })),
            subscribed: BTreeSet::new(),
        }
    }

    pub fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    pub fn device_type(&self) -> DeviceType {
        self.decoder.device_type()
    }

    pub fn decoder(&self) -> &dyn DeviceDecoder {
        self.decoder.as_ref()
    }

    pub fn state(&self) -> SessionState {
        lock(&self.dispatch).state
    }

    pub fn active_streams(&self) -> Vec<StreamKind> {
        lock(&self.dispatch).streams.keys().copied().collect()
    }

    pub fn callback_count(&self, kind: StreamKind) -> usize {
        lock(&self.dispatch)
            .streams
            .get(&kind)
            .map_or(0, |s| s.callbacks.len())
    }

    /// Characteristics currently subscribed on the peripheral.
    pub fn subscribed_characteristics(&self) -> &BTreeSet<Uuid> {
        &self.subscribed
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.expect_state("connect", &[SessionState::Created])?;
        let peripheral = self.peripheral("connect")?;

        info!(
            "Connecting to {} ({})",
            self.identity.display_name(),
            self.identity.address
        );
        peripheral
            .connect()
            .await
            .map_err(|e| HrmError::ConnectionFailed(e.to_string()))?;

        self.set_state(SessionState::Connected);
        info!("Connected to {}", self.identity.display_name());
        Ok(())
    }

    /// Read model number, manufacturer name and battery level. Characteristics
    /// the device does not expose come back as `None`.
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        const OPERATION: &str = "read device info";
        self.expect_state(OPERATION, &[SessionState::Connected, SessionState::Streaming])?;
        let peripheral = self.peripheral(OPERATION)?;

        let model = read_optional(peripheral, MODEL_NUMBER_UUID).await?;
        let manufacturer = read_optional(peripheral, MANUFACTURER_NAME_UUID).await?;
        let battery = read_optional(peripheral, BATTERY_LEVEL_UUID).await?;

        Ok(DeviceInfo {
            model: model.map(|v| device_info::decode_string(&v)),
            manufacturer: manufacturer.map(|v| device_info::decode_string(&v)),
            battery_percent: battery.and_then(|v| device_info::decode_battery_level(&v)),
        })
    }

    /// Register `callback` for `kind`, subscribing whatever the stream needs.
    pub async fn start_stream(
        &mut self,
        kind: StreamKind,
        callback: SampleCallback,
    ) -> Result<()> {
        self.expect_state(
            "start a stream",
            &[SessionState::Connected, SessionState::Streaming],
        )?;
        if !self.decoder.supports(kind) {
            return Err(self.decoder.unsupported(kind));
        }
        let required = self.decoder.required_characteristics(kind)?;

        {
            let mut dispatch = lock(&self.dispatch);
            if let Some(stream) = dispatch.streams.get_mut(&kind) {
                if stream.callbacks.iter().any(|c| c.same_as(&callback)) {
                    return Err(HrmError::AlreadyStreaming(kind));
                }
                stream.callbacks.push(callback);
                debug!(
                    "Added {} callback ({} registered)",
                    kind,
                    stream.callbacks.len()
                );
                return Ok(());
            }
        }

        let newly_subscribed = self.subscribe_all(&required).await?;

        lock(&self.dispatch).streams.insert(
            kind,
            StreamSubscription {
                characteristics: required,
                callbacks: vec![callback],
            },
        );

        for command in self.decoder.start_commands(kind) {
            let written = self
                .peripheral("start a stream")?
                .write(command.characteristic, &command.value)
                .await;
            if let Err(e) = written {
                lock(&self.dispatch).streams.remove(&kind);
                self.unsubscribe_many(newly_subscribed).await;
                return Err(HrmError::SubscriptionFailed {
                    characteristic: command.characteristic,
                    reason: e.to_string(),
                });
            }
        }

        self.set_state(SessionState::Streaming);
        info!("Started {} stream on {}", kind, self.identity.display_name());
        Ok(())
    }

    /// Drop every callback for `kind` and release characteristics no other
    /// active stream needs. Stopping an inactive stream is a no-op.
    pub async fn stop_stream(&mut self, kind: StreamKind) -> Result<()> {
        let remaining = {
            let mut dispatch = lock(&self.dispatch);
            if dispatch.streams.remove(&kind).is_none() {
                return Ok(());
            }
            if dispatch.streams.is_empty() {
                dispatch.state = SessionState::Connected;
            }
            dispatch.streams.len()
        };

        let peripheral = self.peripheral("stop a stream")?;
        let mut first_error = None;
        for command in self.decoder.stop_commands(kind) {
            if let Err(e) = peripheral.write(command.characteristic, &command.value).await {
                warn!("Stop command for {} failed: {}", kind, e);
                first_error.get_or_insert(HrmError::SubscriptionFailed {
                    characteristic: command.characteristic,
                    reason: e.to_string(),
                });
            }
        }

        let still_needed = self.characteristics_in_use();
        let released: Vec<Uuid> = self
            .subscribed
            .iter()
            .filter(|c| !still_needed.contains(c))
            .copied()
            .collect();
        for characteristic in released {
            self.subscribed.remove(&characteristic);
            if let Err(e) = self.peripheral("stop a stream")?.unsubscribe(characteristic).await {
                warn!("Unsubscribe from {} failed: {}", characteristic, e);
                first_error.get_or_insert(HrmError::SubscriptionFailed {
                    characteristic,
                    reason: e.to_string(),
                });
            }
        }

        info!("Stopped {} stream ({} still active)", kind, remaining);
        first_error.map_or(Ok(()), Err)
    }

    /// Tear everything down. The session cannot be reused afterwards; calling
    /// this again is a no-op.
    pub async fn disconnect(&mut self) -> Result<()> {
        let (previous, streams) = {
            let mut dispatch = lock(&self.dispatch);
            let previous = dispatch.state;
            dispatch.state = SessionState::Disconnected;
            (previous, std::mem::take(&mut dispatch.streams))
        };
        let Some(peripheral) = self.peripheral.take() else {
            return Ok(());
        };
        if previous == SessionState::Created {
            debug!("Session for {} closed before connecting", self.identity.display_name());
            return Ok(());
        }

        for kind in streams.keys() {
            for command in self.decoder.stop_commands(*kind) {
                if let Err(e) = peripheral.write(command.characteristic, &command.value).await {
                    debug!("Stop command for {} failed during disconnect: {}", kind, e);
                }
            }
        }
        for characteristic in std::mem::take(&mut self.subscribed) {
            if let Err(e) = peripheral.unsubscribe(characteristic).await {
                debug!("Unsubscribe from {} failed during disconnect: {}", characteristic, e);
            }
        }

        let result = peripheral
            .disconnect()
            .await
            .map_err(|e| HrmError::ConnectionFailed(e.to_string()));
        info!("Disconnected from {}", self.identity.display_name());
        result
    }

    fn notification_handler(&self) -> NotificationHandler {
        let dispatch = Arc::clone(&self.dispatch);
        let decoder = Arc::clone(&self.decoder);
        Arc::new(move |notification| {
            dispatch_notification(&dispatch, decoder.as_ref(), notification)
        })
    }

    /// Subscribe to every characteristic in `required` not already subscribed.
    /// On failure the ones subscribed by this call are released again.
    async fn subscribe_all(&mut self, required: &BTreeSet<Uuid>) -> Result<Vec<Uuid>> {
        let mut newly_subscribed = Vec::new();
        for characteristic in required.iter().copied() {
            if self.subscribed.contains(&characteristic) {
                trace!("{} already subscribed", characteristic);
                continue;
            }
            let handler = self.notification_handler();
            let result = self
                .peripheral("start a stream")?
                .subscribe(characteristic, handler)
                .await;
            match result {
                Ok(()) => {
                    debug!("Subscribed to {}", characteristic);
                    self.subscribed.insert(characteristic);
                    newly_subscribed.push(characteristic);
                }
                Err(e) => {
                    self.unsubscribe_many(newly_subscribed).await;
                    return Err(HrmError::SubscriptionFailed {
                        characteristic,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(newly_subscribed)
    }

    async fn unsubscribe_many(&mut self, characteristics: Vec<Uuid>) {
        let still_needed = self.characteristics_in_use();
        for characteristic in characteristics {
            if still_needed.contains(&characteristic) {
                continue;
            }
            self.subscribed.remove(&characteristic);
            if let Some(peripheral) = &self.peripheral {
                if let Err(e) = peripheral.unsubscribe(characteristic).await {
                    debug!("Rollback unsubscribe from {} failed: {}", characteristic, e);
                }
            }
        }
    }

    fn characteristics_in_use(&self) -> BTreeSet<Uuid> {
        lock(&self.dispatch)
            .streams
            .values()
            .flat_map(|s| s.characteristics.iter().copied())
            .collect()
    }

    fn peripheral(&self, operation: &'static str) -> Result<&dyn Peripheral> {
        self.peripheral
            .as_deref()
            .ok_or(HrmError::InvalidState {
                operation,
                state: SessionState::Disconnected.as_str(),
            })
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(HrmError::InvalidState {
                operation,
                state: state.as_str(),
            })
        }
    }

    fn set_state(&self, state: SessionState) {
        lock(&self.dispatch).state = state;
    }
}

async fn read_optional(peripheral: &dyn Peripheral, characteristic: Uuid) -> Result<Option<Vec<u8>>> {
    match peripheral.read(characteristic).await {
        Ok(value) => Ok(Some(value)),
        Err(TransportError::CharacteristicNotFound(_)) => {
            debug!("{} not exposed", characteristic);
            Ok(None)
        }
        Err(e) => Err(HrmError::ReadFailed {
            characteristic,
            reason: e.to_string(),
        }),
    }
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("identity", &self.identity)
            .field("device_type", &self.device_type())
            .field("state", &self.state())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::decoder::DecoderProfile;
    use crate::domain::models::{AccSample, EcgSample, GattWrite, IbiSample};
    use crate::domain::registry::Registry;
    use crate::infrastructure::bluetooth::simulated::{SimulatedEvent, SimulatedPeripheral};
    use crate::infrastructure::bluetooth::spawn_mock_sensor;
    use crate::protocol::device_info::BATTERY_LEVEL_UUID;
    use crate::protocol::garmin_hrm_pro::GarminHrmPro;
    use crate::protocol::heart_rate::HeartRateMeasurement;
    use crate::protocol::polar_h10::{
        PolarH10, PMD_CONTROL_UUID, PMD_DATA_UUID, START_ACC, START_ECG,
    };
    use crate::protocol::HEART_RATE_MEASUREMENT_UUID;

    fn dispatch_with(callbacks: Vec<SampleCallback>) -> Mutex<Dispatch> {
        Mutex::new(Dispatch {
            state: SessionState::Streaming,
            streams: BTreeMap::from([(
                StreamKind::Ibi,
                StreamSubscription {
                    characteristics: BTreeSet::from([HEART_RATE_MEASUREMENT_UUID]),
                    callbacks,
                },
            )]),
            last_timestamps: BTreeMap::new(),
        })
    }

    fn collector() -> (SampleCallback, Arc<Mutex<Vec<SampleRecord>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = SampleCallback::from_fn(move |s| sink.lock().unwrap().push(*s));
        (callback, seen)
    }

    fn hrm(rr_ms: u16) -> Vec<u8> {
        let [lo, hi] = rr_ms.to_le_bytes();
        vec![0x10, 70, lo, hi]
    }

    #[test]
    fn test_callback_identity() {
        let a = SampleCallback::from_fn(|_| {});
        let b = SampleCallback::from_fn(|_| {});
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_earlier_timestamps_are_clamped() {
        let (callback, seen) = collector();
        let dispatch = dispatch_with(vec![callback]);
        let decoder = GarminHrmPro;

        for (rr, at) in [(800, 10.0), (900, 9.5), (700, 11.0)] {
            dispatch_notification(
                &dispatch,
                &decoder,
                Notification::new(HEART_RATE_MEASUREMENT_UUID, hrm(rr)).at(at),
            );
        }

        let stamps: Vec<_> = seen.lock().unwrap().iter().map(|s| s.timestamp()).collect();
        assert_eq!(stamps, vec![10.0, 10.0, 11.0]);
    }

    #[test]
    fn test_failing_and_panicking_callbacks_are_isolated() {
        let failing = SampleCallback::new(|_| anyhow::bail!("sink full"));
        let panicking = SampleCallback::from_fn(|_| panic!("boom"));
        let (callback, seen) = collector();
        let dispatch = dispatch_with(vec![failing, panicking, callback]);

        dispatch_notification(
            &dispatch,
            &GarminHrmPro,
            Notification::new(HEART_RATE_MEASUREMENT_UUID, hrm(1000)).at(1.0),
        );
        dispatch_notification(
            &dispatch,
            &GarminHrmPro,
            Notification::new(HEART_RATE_MEASUREMENT_UUID, hrm(950)).at(2.0),
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SampleRecord::Ibi(IbiSample {
                    timestamp: 1.0,
                    ibi_ms: 1000.0
                }),
                SampleRecord::Ibi(IbiSample {
                    timestamp: 2.0,
                    ibi_ms: 950.0
                }),
            ]
        );
    }

    #[test]
    fn test_nothing_delivered_after_disconnect() {
        let (callback, seen) = collector();
        let dispatch = dispatch_with(vec![callback]);
        lock(&dispatch).state = SessionState::Disconnected;

        dispatch_notification(
            &dispatch,
            &GarminHrmPro,
            Notification::new(HEART_RATE_MEASUREMENT_UUID, hrm(800)),
        );
        assert!(seen.lock().unwrap().is_empty());
    }

    async fn streaming_session(name: &str) -> (StreamingSession, SimulatedPeripheral) {
        let peripheral = SimulatedPeripheral::named(name);
        let mut session = Registry::with_builtin_decoders()
            .create_session(Box::new(peripheral.clone()))
            .unwrap();
        session.connect().await.unwrap();
        (session, peripheral)
    }

    fn pmd_frame(measurement: u8, frame_type: u8, samples: &[u8]) -> Vec<u8> {
        let mut frame = vec![measurement];
        frame.extend_from_slice(&123_456_789u64.to_le_bytes());
        frame.push(frame_type);
        frame.extend_from_slice(samples);
        frame
    }

    #[tokio::test]
    async fn test_polar_ecg_frame_reaches_callback() {
        let (mut session, peripheral) = streaming_session("Polar H10 79324520").await;
        let (callback, seen) = collector();
        session.start_stream(StreamKind::Ecg, callback).await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        // 3 whole samples plus one dangling byte
        let frame = pmd_frame(0x00, 0x00, &[0x10, 0x00, 0x00, 0xF0, 0xFF, 0xFF, 0x00, 0x01, 0x00, 0x7F]);
        assert_eq!(frame.len(), 20);
        assert!(peripheral.notify_at(PMD_DATA_UUID, frame, 100.0));

        let samples = seen.lock().unwrap().clone();
        let microvolts: Vec<f64> = samples
            .iter()
            .map(|s| match s {
                SampleRecord::Ecg(EcgSample { microvolts, .. }) => *microvolts,
                other => panic!("unexpected sample {other:?}"),
            })
            .collect();
        assert_eq!(microvolts, vec![16.0, -16.0, 256.0]);

        let stamps: Vec<_> = samples.iter().map(|s| s.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stamps[2], 100.0);
    }

    #[tokio::test]
    async fn test_every_ibi_callback_sees_every_sample_in_order() {
        let (mut session, peripheral) = streaming_session("Polar H10 79324520").await;
        let (first, first_seen) = collector();
        let (second, second_seen) = collector();
        session.start_stream(StreamKind::Ibi, first).await.unwrap();
        session.start_stream(StreamKind::Ibi, second).await.unwrap();
        assert_eq!(session.callback_count(StreamKind::Ibi), 2);
        assert_eq!(
            peripheral.events(),
            vec![
                SimulatedEvent::Connected,
                SimulatedEvent::Subscribed(HEART_RATE_MEASUREMENT_UUID)
            ]
        );

        assert!(peripheral.notify_heart_rate(60, &[1024, 512]));
        assert!(peripheral.notify_heart_rate(61, &[768]));
        assert!(peripheral.notify_heart_rate(62, &[2048]));

        let ibis: Vec<f64> = first_seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| match s {
                SampleRecord::Ibi(IbiSample { ibi_ms, .. }) => *ibi_ms,
                other => panic!("unexpected sample {other:?}"),
            })
            .collect();
        assert_eq!(ibis, vec![1000.0, 500.0, 750.0, 2000.0]);
        assert_eq!(*first_seen.lock().unwrap(), *second_seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_malformed_notification_is_dropped() {
        let (mut session, peripheral) = streaming_session("HRM-Pro:982040").await;
        let (callback, seen) = collector();
        session.start_stream(StreamKind::Ibi, callback).await.unwrap();

        // RR field cut in half
        assert!(peripheral.notify_at(HEART_RATE_MEASUREMENT_UUID, [0x10, 60, 0x20], 1.0));
        assert!(peripheral.notify_at(HEART_RATE_MEASUREMENT_UUID, hrm(850), 2.0));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SampleRecord::Ibi(IbiSample {
                timestamp: 2.0,
                ibi_ms: 850.0
            })]
        );
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_stop_then_disconnect_is_clean_and_terminal() {
        let (mut session, peripheral) = streaming_session("HRM-Pro:982040").await;
        let (callback, seen) = collector();
        session.start_stream(StreamKind::Ibi, callback.clone()).await.unwrap();

        session.stop_stream(StreamKind::Ibi).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(peripheral.subscribed().is_empty());
        session.stop_stream(StreamKind::Ibi).await.unwrap();

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!peripheral.is_connected());
        assert_eq!(
            peripheral.events(),
            vec![
                SimulatedEvent::Connected,
                SimulatedEvent::Subscribed(HEART_RATE_MEASUREMENT_UUID),
                SimulatedEvent::Unsubscribed(HEART_RATE_MEASUREMENT_UUID),
                SimulatedEvent::Disconnected,
            ]
        );

        assert_eq!(
            session.start_stream(StreamKind::Ibi, callback).await,
            Err(HrmError::InvalidState {
                operation: "start a stream",
                state: "disconnected"
            })
        );
        assert_eq!(
            session.connect().await,
            Err(HrmError::InvalidState {
                operation: "connect",
                state: "disconnected"
            })
        );
        assert!(!peripheral.notify_heart_rate(60, &[1000]));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_streaming_releases_everything() {
        let (mut session, peripheral) = streaming_session("Polar H10 1").await;
        let (callback, seen) = collector();
        session.start_stream(StreamKind::Ecg, callback).await.unwrap();

        session.disconnect().await.unwrap();
        assert!(session.active_streams().is_empty());
        assert!(session.subscribed_characteristics().is_empty());
        assert!(peripheral
            .writes()
            .contains(&GattWrite::new(PMD_CONTROL_UUID, [0x03, 0x00])));
        assert!(!peripheral.notify(PMD_DATA_UUID, pmd_frame(0x00, 0x00, &[1, 0, 0])));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_before_connect_is_rejected() {
        let mut session = Registry::with_builtin_decoders()
            .create_session(Box::new(SimulatedPeripheral::named("Polar H10 1")))
            .unwrap();
        let (callback, _) = collector();
        assert_eq!(
            session.start_stream(StreamKind::Ibi, callback).await,
            Err(HrmError::InvalidState {
                operation: "start a stream",
                state: "created"
            })
        );
        // Closing a session that never connected does not touch the transport
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unsupported_kind_and_duplicate_callback() {
        let (mut session, peripheral) = streaming_session("HRM-Pro:982040").await;
        let (callback, _) = collector();

        assert_eq!(
            session.start_stream(StreamKind::Ecg, callback.clone()).await,
            Err(HrmError::UnsupportedStreamKind {
                device: GarminHrmPro::DEVICE_TYPE,
                kind: StreamKind::Ecg
            })
        );
        assert_eq!(session.state(), SessionState::Connected);

        session.start_stream(StreamKind::Ibi, callback.clone()).await.unwrap();
        assert_eq!(
            session.start_stream(StreamKind::Ibi, callback).await,
            Err(HrmError::AlreadyStreaming(StreamKind::Ibi))
        );
        assert_eq!(session.callback_count(StreamKind::Ibi), 1);
        assert_eq!(peripheral.subscribed().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_session_created() {
        let peripheral = SimulatedPeripheral::named("Polar H10 1");
        peripheral.fail_connect("out of range");
        let mut session = Registry::with_builtin_decoders()
            .create_session(Box::new(peripheral))
            .unwrap();

        assert_eq!(
            session.connect().await,
            Err(HrmError::ConnectionFailed("out of range".to_string()))
        );
        assert_eq!(session.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_failed_subscription_is_rolled_back() {
        let (mut session, peripheral) = streaming_session("Polar H10 1").await;
        peripheral.fail_subscribe(PMD_DATA_UUID);
        let (callback, _) = collector();

        let err = session.start_stream(StreamKind::Ecg, callback).await.unwrap_err();
        assert!(matches!(
            err,
            HrmError::SubscriptionFailed { characteristic, .. } if characteristic == PMD_DATA_UUID
        ));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.active_streams().is_empty());
        assert!(session.subscribed_characteristics().is_empty());
        assert!(peripheral.subscribed().is_empty());
        assert!(peripheral.writes().is_empty());
    }

    #[tokio::test]
    async fn test_streams_share_pmd_characteristics() {
        let (mut session, peripheral) = streaming_session("Polar H10 1").await;
        let (ecg, ecg_seen) = collector();
        let (acc, acc_seen) = collector();
        session.start_stream(StreamKind::Ecg, ecg).await.unwrap();
        session.start_stream(StreamKind::Acc, acc).await.unwrap();

        assert_eq!(
            peripheral.events(),
            vec![
                SimulatedEvent::Connected,
                SimulatedEvent::Subscribed(PMD_CONTROL_UUID),
                SimulatedEvent::Subscribed(PMD_DATA_UUID),
                SimulatedEvent::Written(GattWrite::new(PMD_CONTROL_UUID, START_ECG)),
                SimulatedEvent::Written(GattWrite::new(PMD_CONTROL_UUID, START_ACC)),
            ]
        );

        // Control point acknowledgement produces no samples
        assert!(peripheral.notify(PMD_CONTROL_UUID, [0xF0, 0x02, 0x02, 0x00, 0x00]));
        // Two 16-bit ACC samples
        let frame = pmd_frame(0x02, 0x01, &[1, 0, 2, 0, 0xE8, 0x03, 0xFF, 0xFF, 0, 0, 0x18, 0xFC]);
        assert!(peripheral.notify_at(PMD_DATA_UUID, frame, 50.0));

        assert!(ecg_seen.lock().unwrap().is_empty());
        assert_eq!(
            *acc_seen.lock().unwrap(),
            vec![
                SampleRecord::Acc(AccSample {
                    timestamp: 50.0 - 1.0 / 200.0,
                    x_mg: 1.0,
                    y_mg: 2.0,
                    z_mg: 1000.0
                }),
                SampleRecord::Acc(AccSample {
                    timestamp: 50.0,
                    x_mg: -1.0,
                    y_mg: 0.0,
                    z_mg: -1000.0
                }),
            ]
        );

        session.stop_stream(StreamKind::Ecg).await.unwrap();
        assert_eq!(peripheral.subscribed().len(), 2);
        assert_eq!(session.state(), SessionState::Streaming);

        session.stop_stream(StreamKind::Acc).await.unwrap();
        assert!(peripheral.subscribed().is_empty());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            peripheral.writes()[2..],
            [
                GattWrite::new(PMD_CONTROL_UUID, [0x03, 0x00]),
                GattWrite::new(PMD_CONTROL_UUID, [0x03, 0x02]),
            ]
        );
        assert_eq!(PolarH10::DEVICE_TYPE, session.device_type());
    }

    #[tokio::test]
    async fn test_restarted_stream_never_goes_back_in_time() {
        let (mut session, peripheral) = streaming_session("HRM-Pro:982040").await;
        let (callback, seen) = collector();
        session.start_stream(StreamKind::Ibi, callback.clone()).await.unwrap();
        assert!(peripheral.notify_at(HEART_RATE_MEASUREMENT_UUID, hrm(800), 10.0));

        session.stop_stream(StreamKind::Ibi).await.unwrap();
        session.start_stream(StreamKind::Ibi, callback).await.unwrap();

        // The 100 ms interval back-dates to 8.5 s, before the last delivery
        let batch = HeartRateMeasurement {
            bpm: 70,
            energy_expended: None,
            rr_intervals: vec![100, 2000],
        }
        .to_bytes();
        assert!(peripheral.notify_at(HEART_RATE_MEASUREMENT_UUID, batch, 10.5));

        let stamps: Vec<_> = seen.lock().unwrap().iter().map(|s| s.timestamp()).collect();
        assert_eq!(stamps, vec![10.0, 10.0, 10.5]);
    }

    #[tokio::test]
    async fn test_device_info_reads_exposed_characteristics() {
        let peripheral = SimulatedPeripheral::named("Polar H10 1");
        peripheral.set_value(BATTERY_LEVEL_UUID, [64]);
        let mut session = Registry::with_builtin_decoders()
            .create_session(Box::new(peripheral.clone()))
            .unwrap();
        assert_eq!(
            session.device_info().await,
            Err(HrmError::InvalidState {
                operation: "read device info",
                state: "created"
            })
        );

        session.connect().await.unwrap();
        assert_eq!(
            session.device_info().await.unwrap(),
            DeviceInfo {
                model: None,
                manufacturer: None,
                battery_percent: Some(64)
            }
        );

        session.disconnect().await.unwrap();
        assert!(matches!(
            session.device_info().await,
            Err(HrmError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_sensor_streams_without_hardware() {
        let peripheral = SimulatedPeripheral::mock_sensor("MOCK001");
        let generator = spawn_mock_sensor(peripheral.clone());
        let mut session = Registry::with_builtin_decoders()
            .create_session(Box::new(peripheral))
            .unwrap();
        session.connect().await.unwrap();

        let info = session.device_info().await.unwrap();
        assert_eq!(info.model.as_deref(), Some("Mock"));
        assert_eq!(info.manufacturer.as_deref(), Some("Mock sensor ltd"));
        assert_eq!(info.battery_percent, Some(99));

        let (ibi, ibi_seen) = collector();
        let (acc, acc_seen) = collector();
        session.start_stream(StreamKind::Ibi, ibi).await.unwrap();
        session.start_stream(StreamKind::Acc, acc).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;

        let ibis = ibi_seen.lock().unwrap().clone();
        assert!(ibis.len() >= 2, "{} beats", ibis.len());
        for sample in &ibis {
            let SampleRecord::Ibi(IbiSample { ibi_ms, .. }) = sample else {
                panic!("unexpected sample {sample:?}");
            };
            assert!((800.0..=1300.0).contains(ibi_ms));
        }
        assert!(acc_seen.lock().unwrap().len() > 100);

        session.disconnect().await.unwrap();
        generator.await.unwrap();
    }
}
