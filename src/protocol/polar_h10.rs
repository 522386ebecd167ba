//! Polar H10 Protocol
//!
//! Interbeat intervals come from the standard Heart Rate Measurement
//! characteristic. ECG and accelerometer data are streamed over the Polar
//! Measurement Data (PMD) service: a start request is written to the PMD
//! control point and frames arrive on the PMD data characteristic.

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{
    AccSample, DeviceType, EcgSample, GattWrite, SampleRecord, StreamKind, Timestamp,
};
use crate::error::{HrmError, Result};
use crate::protocol::heart_rate::{self, RrResolution};
use crate::protocol::{read_signed_le, spread_timestamps, HEART_RATE_MEASUREMENT_UUID};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::{uuid, Uuid};

/// PMD Service UUID
pub const PMD_SERVICE_UUID: Uuid = uuid!("fb005c80-02e7-f387-1cad-8acd2d8df0c8");

/// PMD Control Point - start/stop requests are written here, responses come back as indications
pub const PMD_CONTROL_UUID: Uuid = uuid!("fb005c81-02e7-f387-1cad-8acd2d8df0c8");

/// PMD Data - measurement frames
pub const PMD_DATA_UUID: Uuid = uuid!("fb005c82-02e7-f387-1cad-8acd2d8df0c8");

/// ECG sample rate in Hz
pub const ECG_SAMPLE_RATE: f64 = 130.0;

/// Accelerometer sample rate in Hz
pub const ACC_SAMPLE_RATE: f64 = 200.0;

/// PMD measurement type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Measurement {
    Ecg = 0x00,
    Acc = 0x02,
}

/// Start ECG: 130 Hz, 14-bit resolution
pub const START_ECG: [u8; 10] = [0x02, 0x00, 0x00, 0x01, 0x82, 0x00, 0x01, 0x01, 0x0E, 0x00];

/// Start ACC: 200 Hz, 16-bit resolution, 8 G range
pub const START_ACC: [u8; 14] = [
    0x02, 0x02, 0x00, 0x01, 0xC8, 0x00, 0x01, 0x01, 0x10, 0x00, 0x02, 0x01, 0x08, 0x00,
];

const STOP_REQUEST: u8 = 0x03;
const CONTROL_RESPONSE: u8 = 0xF0;

/// Measurement type, 8-byte sensor timestamp, frame type
const HEADER_LEN: usize = 10;

const ECG_SAMPLE_BYTES: usize = 3;

const STREAM_KINDS: &[StreamKind] = &[StreamKind::Ibi, StreamKind::Ecg, StreamKind::Acc];

#[derive(Debug, Default)]
pub struct PolarH10;

impl DecoderProfile for PolarH10 {
    const DEVICE_TYPE: DeviceType = DeviceType("PolarH10");
    const STREAM_KINDS: &'static [StreamKind] = STREAM_KINDS;

    fn is_supported(device_name: &str) -> bool {
        device_name.contains("Polar H10")
    }
}

impl DeviceDecoder for PolarH10 {
    fn device_type(&self) -> DeviceType {
        Self::DEVICE_TYPE
    }

    fn stream_kinds(&self) -> &'static [StreamKind] {
        STREAM_KINDS
    }

    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>> {
        Ok(match kind {
            StreamKind::Ibi => BTreeSet::from([HEART_RATE_MEASUREMENT_UUID]),
            StreamKind::Ecg | StreamKind::Acc => BTreeSet::from([PMD_CONTROL_UUID, PMD_DATA_UUID]),
        })
    }

    fn start_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        match kind {
            StreamKind::Ibi => Vec::new(),
            StreamKind::Ecg => vec![GattWrite::new(PMD_CONTROL_UUID, START_ECG)],
            StreamKind::Acc => vec![GattWrite::new(PMD_CONTROL_UUID, START_ACC)],
        }
    }

    fn stop_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        match kind {
            StreamKind::Ibi => Vec::new(),
            StreamKind::Ecg => vec![GattWrite::new(
                PMD_CONTROL_UUID,
                [STOP_REQUEST, Measurement::Ecg as u8],
            )],
            StreamKind::Acc => vec![GattWrite::new(
                PMD_CONTROL_UUID,
                [STOP_REQUEST, Measurement::Acc as u8],
            )],
        }
    }

    fn decode(
        &self,
        kind: StreamKind,
        characteristic: Uuid,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Vec<SampleRecord>> {
        if characteristic == PMD_CONTROL_UUID {
            log_control_response(payload);
            return Ok(Vec::new());
        }
        match kind {
            StreamKind::Ibi => heart_rate::decode_ibi(payload, RrResolution::Units1024, received_at),
            StreamKind::Ecg => decode_ecg(payload, received_at),
            StreamKind::Acc => decode_acc(payload, received_at),
        }
    }
}

/// Parse a PMD ECG frame
///
/// ```text
/// [0]     : Measurement type (0x00)
/// [1-8]   : Sensor timestamp (u64 little-endian, ns)
/// [9]     : Frame type (0x00)
/// [10..]  : Samples, 3 bytes each (i24 little-endian, microvolts)
/// ```
///
/// Trailing bytes that do not fill a whole sample are ignored.
pub fn decode_ecg(payload: &[u8], received_at: Timestamp) -> Result<Vec<SampleRecord>> {
    let Some(measurement) = payload.first() else {
        return Err(HrmError::malformed(StreamKind::Ecg, payload, "empty frame"));
    };
    if *measurement != Measurement::Ecg as u8 {
        return Ok(Vec::new());
    }
    if payload.len() < HEADER_LEN + ECG_SAMPLE_BYTES {
        return Err(HrmError::malformed(
            StreamKind::Ecg,
            payload,
            format!("need at least {} bytes", HEADER_LEN + ECG_SAMPLE_BYTES),
        ));
    }
    if payload[9] != 0x00 {
        return Err(HrmError::malformed(
            StreamKind::Ecg,
            payload,
            format!("unsupported frame type {:#04x}", payload[9]),
        ));
    }

    let chunks = payload[HEADER_LEN..].chunks_exact(ECG_SAMPLE_BYTES);
    let timestamps = spread_timestamps(received_at, chunks.len(), ECG_SAMPLE_RATE);
    Ok(chunks
        .zip(timestamps)
        .map(|(chunk, timestamp)| {
            SampleRecord::Ecg(EcgSample {
                timestamp,
                microvolts: read_signed_le(chunk) as f64,
            })
        })
        .collect())
}

/// Parse a PMD accelerometer frame
///
/// ```text
/// [0]     : Measurement type (0x02)
/// [1-8]   : Sensor timestamp (u64 little-endian, ns)
/// [9]     : Frame type: 0x00 = 8-bit, 0x01 = 16-bit, 0x02 = 24-bit axes
/// [10..]  : Samples, x/y/z signed little-endian, milli-g
/// ```
pub fn decode_acc(payload: &[u8], received_at: Timestamp) -> Result<Vec<SampleRecord>> {
    let Some(measurement) = payload.first() else {
        return Err(HrmError::malformed(StreamKind::Acc, payload, "empty frame"));
    };
    if *measurement != Measurement::Acc as u8 {
        return Ok(Vec::new());
    }
    if payload.len() <= HEADER_LEN {
        return Err(HrmError::malformed(StreamKind::Acc, payload, "header only"));
    }

    let axis_bytes = match payload[9] {
        0x00 => 1,
        0x01 => 2,
        0x02 => 3,
        other => {
            return Err(HrmError::malformed(
                StreamKind::Acc,
                payload,
                format!("unsupported frame type {other:#04x}"),
            ))
        }
    };
    let sample_bytes = axis_bytes * 3;
    if payload.len() < HEADER_LEN + sample_bytes {
        return Err(HrmError::malformed(
            StreamKind::Acc,
            payload,
            format!("need at least {} bytes", HEADER_LEN + sample_bytes),
        ));
    }

    let chunks = payload[HEADER_LEN..].chunks_exact(sample_bytes);
    let timestamps = spread_timestamps(received_at, chunks.len(), ACC_SAMPLE_RATE);
    Ok(chunks
        .zip(timestamps)
        .map(|(chunk, timestamp)| {
            let (x, rest) = chunk.split_at(axis_bytes);
            let (y, z) = rest.split_at(axis_bytes);
            SampleRecord::Acc(AccSample {
                timestamp,
                x_mg: read_signed_le(x) as f64,
                y_mg: read_signed_le(y) as f64,
                z_mg: read_signed_le(z) as f64,
            })
        })
        .collect())
}

fn log_control_response(payload: &[u8]) {
    match payload {
        [CONTROL_RESPONSE, op, measurement, status, ..] if *status != 0 => {
            warn!(
                "PMD request {:#04x} for measurement {:#04x} rejected with status {}",
                op, measurement, status
            );
        }
        _ => debug!("PMD control response: {:02X?}", payload),
    }
}
