//! Mock Sensor
//!
//! A strap that only exists in software, for trying the pipeline without
//! hardware. RR intervals arrive on the standard HRM characteristic in
//! milliseconds. Accelerometer frames arrive on a private characteristic as
//! packed `f32` little-endian x/y/z triples in g.
//!
//! [`spawn_mock_sensor`](crate::infrastructure::bluetooth::simulated::spawn_mock_sensor)
//! produces this traffic on a simulated peripheral.

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{AccSample, DeviceType, SampleRecord, StreamKind, Timestamp};
use crate::error::{HrmError, Result};
use crate::protocol::heart_rate::{self, RrResolution};
use crate::protocol::{spread_timestamps, HEART_RATE_MEASUREMENT_UUID};
use std::collections::BTreeSet;
use uuid::{uuid, Uuid};

/// Accelerometer characteristic of the mock strap
pub const MOCK_ACC_UUID: Uuid = uuid!("6d6f636b-0001-4000-8000-00805f9b34fb");

pub const ACC_SAMPLE_RATE: f64 = 100.0;

const SAMPLE_BYTES: usize = 12;

const STREAM_KINDS: &[StreamKind] = &[StreamKind::Ibi, StreamKind::Acc];

/// Encode one accelerometer sample, axes in g.
pub fn acc_payload(x_g: f32, y_g: f32, z_g: f32) -> Vec<u8> {
    [x_g, y_g, z_g]
        .iter()
        .flat_map(|axis| axis.to_le_bytes())
        .collect()
}

#[derive(Debug, Default)]
pub struct MockSensor;

impl DecoderProfile for MockSensor {
    const DEVICE_TYPE: DeviceType = DeviceType("MockSensor");
    const STREAM_KINDS: &'static [StreamKind] = STREAM_KINDS;

    fn is_supported(device_name: &str) -> bool {
        device_name.contains("Mock")
    }
}

impl DeviceDecoder for MockSensor {
    fn device_type(&self) -> DeviceType {
        Self::DEVICE_TYPE
    }

    fn stream_kinds(&self) -> &'static [StreamKind] {
        STREAM_KINDS
    }

    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>> {
        match kind {
            StreamKind::Ibi => Ok(BTreeSet::from([HEART_RATE_MEASUREMENT_UUID])),
            StreamKind::Acc => Ok(BTreeSet::from([MOCK_ACC_UUID])),
            other => Err(self.unsupported(other)),
        }
    }

    fn decode(
        &self,
        kind: StreamKind,
        _characteristic: Uuid,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Vec<SampleRecord>> {
        match kind {
            StreamKind::Ibi => heart_rate::decode_ibi(payload, RrResolution::Millis, received_at),
            StreamKind::Acc => decode_acc(payload, received_at),
            other => Err(self.unsupported(other)),
        }
    }
}

fn decode_acc(payload: &[u8], received_at: Timestamp) -> Result<Vec<SampleRecord>> {
    if payload.is_empty() || payload.len() % SAMPLE_BYTES != 0 {
        return Err(HrmError::malformed(
            StreamKind::Acc,
            payload,
            format!("expected a multiple of {SAMPLE_BYTES} bytes"),
        ));
    }

    let chunks = payload.chunks_exact(SAMPLE_BYTES);
    let timestamps = spread_timestamps(received_at, chunks.len(), ACC_SAMPLE_RATE);
    Ok(chunks
        .zip(timestamps)
        .map(|(chunk, timestamp)| {
            let axis = |i: usize| {
                let g = f32::from_le_bytes([chunk[i], chunk[i + 1], chunk[i + 2], chunk[i + 3]]);
                g as f64 * 1000.0
            };
            SampleRecord::Acc(AccSample {
                timestamp,
                x_mg: axis(0),
                y_mg: axis(4),
                z_mg: axis(8),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acc_payload_decodes_to_milli_g() {
        let samples = MockSensor
            .decode(StreamKind::Acc, MOCK_ACC_UUID, &acc_payload(0.5, -1.0, 0.0), 3.0)
            .unwrap();
        assert_eq!(
            samples,
            vec![SampleRecord::Acc(AccSample {
                timestamp: 3.0,
                x_mg: 500.0,
                y_mg: -1000.0,
                z_mg: 0.0
            })]
        );
    }

    #[test]
    fn test_partial_acc_sample_rejected() {
        let mut payload = acc_payload(0.0, 0.0, 1.0);
        payload.pop();
        assert!(MockSensor
            .decode(StreamKind::Acc, MOCK_ACC_UUID, &payload, 0.0)
            .is_err());
    }

    #[test]
    fn test_rr_in_milliseconds() {
        let samples = MockSensor
            .decode(StreamKind::Ibi, HEART_RATE_MEASUREMENT_UUID, &[0x10, 60, 0xE8, 0x03], 1.0)
            .unwrap();
        assert_eq!(samples[0].timestamp(), 1.0);
        assert!(matches!(
            samples[0],
            SampleRecord::Ibi(ibi) if ibi.ibi_ms == 1000.0
        ));
    }
}
