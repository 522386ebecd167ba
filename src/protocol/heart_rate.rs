//! Heart Rate Measurement characteristic (0x2A37)
//!
//! # Packet Structure
//!
//! ```text
//! [0]      : Flags
//!            bit 0: heart rate is u16 (else u8)
//!            bit 1-2: sensor contact status / support
//!            bit 3: energy expended field present
//!            bit 4: RR intervals present
//! [1..]    : Heart rate (u8 or u16 little-endian)
//! [..]     : Energy expended (u16 little-endian, if flagged)
//! [..end]  : RR intervals (u16 little-endian each, if flagged)
//! ```

use crate::domain::models::{IbiSample, SampleRecord, StreamKind, Timestamp};
use crate::error::{HrmError, Result};
use bitflags::bitflags;
use tracing::debug;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const RATE_U16 = 1 << 0;
        const SENSOR_CONTACT_STATUS = 1 << 1;
        const SENSOR_CONTACT_SUPPORT = 1 << 2;
        const ENERGY_EXPENDED = 1 << 3;
        const RR_INTERVAL = 1 << 4;
    }
}

/// Unit of the raw RR interval values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrResolution {
    /// 1/1024 s, as the Bluetooth SIG defines it.
    Units1024,
    /// Already milliseconds.
    Millis,
}

impl RrResolution {
    pub fn to_millis(self, raw: u16) -> f64 {
        match self {
            Self::Units1024 => raw as f64 * 1000.0 / 1024.0,
            Self::Millis => raw as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub energy_expended: Option<u16>,
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = |reason: &str| HrmError::malformed(StreamKind::Ibi, payload, reason);

        let flags = Flags::from_bits_retain(*payload.first().ok_or_else(|| malformed("empty"))?);
        let mut offset = 1;

        let bpm = if flags.contains(Flags::RATE_U16) {
            let bytes = payload
                .get(offset..offset + 2)
                .ok_or_else(|| malformed("truncated u16 heart rate"))?;
            offset += 2;
            u16::from_le_bytes([bytes[0], bytes[1]])
        } else {
            let byte = *payload
                .get(offset)
                .ok_or_else(|| malformed("truncated u8 heart rate"))?;
            offset += 1;
            byte as u16
        };

        let energy_expended = if flags.contains(Flags::ENERGY_EXPENDED) {
            let bytes = payload
                .get(offset..offset + 2)
                .ok_or_else(|| malformed("truncated energy expended"))?;
            offset += 2;
            Some(u16::from_le_bytes([bytes[0], bytes[1]]))
        } else {
            None
        };

        let mut rr_intervals = Vec::new();
        if flags.contains(Flags::RR_INTERVAL) {
            let rest = &payload[offset..];
            if rest.len() % 2 != 0 {
                return Err(malformed("odd number of RR interval bytes"));
            }
            rr_intervals.extend(
                rest.chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
            );
        }

        Ok(Self {
            bpm,
            energy_expended,
            rr_intervals,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flags = Flags::empty();
        if self.bpm > u8::MAX as u16 {
            flags |= Flags::RATE_U16;
        }
        if self.energy_expended.is_some() {
            flags |= Flags::ENERGY_EXPENDED;
        }
        if !self.rr_intervals.is_empty() {
            flags |= Flags::RR_INTERVAL;
        }

        let mut bytes = vec![flags.bits()];
        if flags.contains(Flags::RATE_U16) {
            bytes.extend_from_slice(&self.bpm.to_le_bytes());
        } else {
            bytes.push(self.bpm as u8);
        }
        if let Some(energy) = self.energy_expended {
            bytes.extend_from_slice(&energy.to_le_bytes());
        }
        for rr in &self.rr_intervals {
            bytes.extend_from_slice(&rr.to_le_bytes());
        }
        bytes
    }
}

/// Decode a measurement into IBI samples.
///
/// The last interval is stamped with `received_at`; each earlier one is
/// back-dated by the durations that follow it.
pub fn decode_ibi(
    payload: &[u8],
    resolution: RrResolution,
    received_at: Timestamp,
) -> Result<Vec<SampleRecord>> {
    let measurement = HeartRateMeasurement::parse(payload)?;
    if measurement.rr_intervals.is_empty() {
        debug!(
            "No RR intervals in measurement (bpm {}, flags {:08b})",
            measurement.bpm, payload[0]
        );
        return Ok(Vec::new());
    }

    let intervals: Vec<f64> = measurement
        .rr_intervals
        .iter()
        .map(|raw| resolution.to_millis(*raw))
        .collect();

    let mut samples = Vec::with_capacity(intervals.len());
    let mut timestamp = received_at;
    for ibi_ms in intervals.iter().rev() {
        samples.push(SampleRecord::Ibi(IbiSample {
            timestamp,
            ibi_ms: *ibi_ms,
        }));
        timestamp -= ibi_ms / 1000.0;
    }
    samples.reverse();
    Ok(samples)
}
