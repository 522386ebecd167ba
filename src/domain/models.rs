use crate::error::HrmError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Seconds since the Unix epoch.
pub type Timestamp = f64;

/// Wall-clock receipt time for a notification.
pub fn now_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Tag identifying a decoder implementation, e.g. `PolarH10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceType(pub &'static str);

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Ibi,
    Ecg,
    Acc,
}

impl StreamKind {
    pub const ALL: [StreamKind; 3] = [StreamKind::Ibi, StreamKind::Ecg, StreamKind::Acc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ibi => "ibi",
            Self::Ecg => "ecg",
            Self::Acc => "acc",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = HrmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ibi" => Ok(Self::Ibi),
            "ecg" => Ok(Self::Ecg),
            "acc" => Ok(Self::Acc),
            other => Err(HrmError::UnknownStreamKind(other.to_string())),
        }
    }
}

/// What discovery tells us about a peripheral before connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralIdentity {
    pub name: Option<String>,
    pub address: String,
    pub services: BTreeSet<Uuid>,
}

impl PeripheralIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
            services: BTreeSet::new(),
        }
    }

    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.services.extend(services);
        self
    }

    /// Advertised name, or `"N/A"` for anonymous advertisers.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("N/A")
    }
}

/// Interbeat interval in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IbiSample {
    pub timestamp: Timestamp,
    pub ibi_ms: f64,
}

/// One electrocardiogram sample in microvolts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EcgSample {
    pub timestamp: Timestamp,
    pub microvolts: f64,
}

/// One accelerometer reading, all axes in milli-g.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AccSample {
    pub timestamp: Timestamp,
    pub x_mg: f64,
    pub y_mg: f64,
    pub z_mg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SampleRecord {
    Ibi(IbiSample),
    Ecg(EcgSample),
    Acc(AccSample),
}

impl SampleRecord {
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Ibi(_) => StreamKind::Ibi,
            Self::Ecg(_) => StreamKind::Ecg,
            Self::Acc(_) => StreamKind::Acc,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Ibi(s) => s.timestamp,
            Self::Ecg(s) => s.timestamp,
            Self::Acc(s) => s.timestamp,
        }
    }

    pub(crate) fn set_timestamp(&mut self, timestamp: Timestamp) {
        match self {
            Self::Ibi(s) => s.timestamp = timestamp,
            Self::Ecg(s) => s.timestamp = timestamp,
            Self::Acc(s) => s.timestamp = timestamp,
        }
    }
}

impl fmt::Display for SampleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ibi(s) => write!(
                f,
                "{:.3} ibi {:.0} ms ({:.1} bpm)",
                s.timestamp,
                s.ibi_ms,
                60_000.0 / s.ibi_ms
            ),
            Self::Ecg(s) => write!(f, "{:.3} ecg {:.0} uV", s.timestamp, s.microvolts),
            Self::Acc(s) => write!(
                f,
                "{:.3} acc x={:.0} y={:.0} z={:.0} mG",
                s.timestamp, s.x_mg, s.y_mg, s.z_mg
            ),
        }
    }
}

/// A raw value pushed by a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub received_at: Timestamp,
}

impl Notification {
    pub fn new(characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
            received_at: now_timestamp(),
        }
    }

    pub fn at(mut self, received_at: Timestamp) -> Self {
        self.received_at = received_at;
        self
    }
}

/// A characteristic write a decoder needs issued around a stream's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWrite {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

impl GattWrite {
    pub fn new(characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            value: value.into(),
        }
    }
}

/// Identification and battery state read from a connected peripheral.
///
/// Fields the device does not expose stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub battery_percent: Option<u8>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model No.: {}", self.model.as_deref().unwrap_or("N/A"))?;
        writeln!(
            f,
            "Manufacturer: {}",
            self.manufacturer.as_deref().unwrap_or("N/A")
        )?;
        match self.battery_percent {
            Some(level) => write!(f, "Battery: {level}%"),
            None => write!(f, "Battery: N/A"),
        }
    }
}
