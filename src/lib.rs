//! BLE heart-rate monitor streaming.
//!
//! Matches discovered peripherals to a device profile, subscribes to the
//! characteristics that profile needs and turns raw notifications into
//! timestamped interbeat-interval, ECG and accelerometer samples.
//!
//! ```text
//! discovery ─▶ Registry::create_session ─▶ StreamingSession::connect
//!          ─▶ start_stream(kind, callback) ─▶ decode ─▶ callback(sample)
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod protocol;

pub use domain::decoder::{DecoderProfile, DeviceDecoder};
pub use domain::models::{
    AccSample, DeviceInfo, DeviceType, EcgSample, IbiSample, PeripheralIdentity, SampleRecord,
    StreamKind, Timestamp,
};
pub use domain::registry::{DecoderDescriptor, Registry, SupportedPeripheral};
pub use domain::session::{SampleCallback, SessionState, StreamingSession};
pub use error::{HrmError, TransportError};
pub use infrastructure::bluetooth::{NotificationHandler, Peripheral};
