//! Movesense Protocol
//!
//! Heart rate and RR intervals use the standard HRM characteristic. ECG and
//! accelerometer streams go through the Generic Sensor Protocol (GSP): a
//! subscribe command naming a sensor resource is written to the command
//! characteristic and data frames arrive on the data characteristic, tagged
//! with the reference byte chosen at subscription time.

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{
    AccSample, DeviceType, EcgSample, GattWrite, SampleRecord, StreamKind, Timestamp,
};
use crate::error::{HrmError, Result};
use crate::protocol::heart_rate::{self, RrResolution};
use crate::protocol::{spread_timestamps, HEART_RATE_MEASUREMENT_UUID, STANDARD_GRAVITY};
use std::collections::BTreeSet;
use uuid::{uuid, Uuid};

/// GSP Service UUID
pub const GSP_SERVICE_UUID: Uuid = uuid!("34802252-7185-4d5d-b431-630e7050e8f0");

/// GSP Command characteristic - where subscribe/unsubscribe commands are sent
pub const GSP_COMMAND_UUID: Uuid = uuid!("34800001-7185-4d5d-b431-630e7050e8f0");

/// GSP Data characteristic - command results and sensor frames
pub const GSP_DATA_UUID: Uuid = uuid!("34800002-7185-4d5d-b431-630e7050e8f0");

pub const ECG_SAMPLE_RATE: f64 = 125.0;
pub const ACC_SAMPLE_RATE: f64 = 52.0;

/// Microvolts per raw ECG count
pub const ECG_SCALE: f64 = 0.381_469_726_562_5;

const ECG_RESOURCE: &str = "/Meas/ECG/125";
const ACC_RESOURCE: &str = "/Meas/Acc/52";

/// Reference bytes tagging our subscriptions
const ECG_REFERENCE: u8 = 101;
const ACC_REFERENCE: u8 = 102;

mod op {
    pub const SUBSCRIBE: u8 = 0x01;
    pub const UNSUBSCRIBE: u8 = 0x02;
}

mod response {
    pub const DATA: u8 = 0x02;
}

/// Response code, reference, u32 sensor timestamp (ms)
const HEADER_LEN: usize = 6;

const STREAM_KINDS: &[StreamKind] = &[StreamKind::Ibi, StreamKind::Ecg, StreamKind::Acc];

#[derive(Debug, Default)]
pub struct Movesense;

impl DecoderProfile for Movesense {
    const DEVICE_TYPE: DeviceType = DeviceType("Movesense");
    const STREAM_KINDS: &'static [StreamKind] = STREAM_KINDS;

    fn is_supported(device_name: &str) -> bool {
        device_name.contains("Movesense")
    }
}

impl DeviceDecoder for Movesense {
    fn device_type(&self) -> DeviceType {
        Self::DEVICE_TYPE
    }

    fn stream_kinds(&self) -> &'static [StreamKind] {
        STREAM_KINDS
    }

    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>> {
        Ok(match kind {
            StreamKind::Ibi => BTreeSet::from([HEART_RATE_MEASUREMENT_UUID]),
            StreamKind::Ecg | StreamKind::Acc => BTreeSet::from([GSP_DATA_UUID]),
        })
    }

    fn start_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        let (reference, resource) = match kind {
            StreamKind::Ibi => return Vec::new(),
            StreamKind::Ecg => (ECG_REFERENCE, ECG_RESOURCE),
            StreamKind::Acc => (ACC_REFERENCE, ACC_RESOURCE),
        };
        let mut command = vec![op::SUBSCRIBE, reference];
        command.extend_from_slice(resource.as_bytes());
        vec![GattWrite::new(GSP_COMMAND_UUID, command)]
    }

    fn stop_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        let reference = match kind {
            StreamKind::Ibi => return Vec::new(),
            StreamKind::Ecg => ECG_REFERENCE,
            StreamKind::Acc => ACC_REFERENCE,
        };
        vec![GattWrite::new(GSP_COMMAND_UUID, [op::UNSUBSCRIBE, reference])]
    }

    fn decode(
        &self,
        kind: StreamKind,
        _characteristic: Uuid,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Vec<SampleRecord>> {
        match kind {
            StreamKind::Ibi => heart_rate::decode_ibi(payload, RrResolution::Units1024, received_at),
            StreamKind::Ecg => {
                let Some(body) = data_body(kind, payload, ECG_REFERENCE, 4)? else {
                    return Ok(Vec::new());
                };
                let chunks = body.chunks_exact(4);
                let timestamps = spread_timestamps(received_at, chunks.len(), ECG_SAMPLE_RATE);
                Ok(chunks
                    .zip(timestamps)
                    .map(|(chunk, timestamp)| {
                        let raw = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        SampleRecord::Ecg(EcgSample {
                            timestamp,
                            microvolts: raw as f64 * ECG_SCALE,
                        })
                    })
                    .collect())
            }
            StreamKind::Acc => {
                let Some(body) = data_body(kind, payload, ACC_REFERENCE, 12)? else {
                    return Ok(Vec::new());
                };
                let chunks = body.chunks_exact(12);
                let timestamps = spread_timestamps(received_at, chunks.len(), ACC_SAMPLE_RATE);
                Ok(chunks
                    .zip(timestamps)
                    .map(|(chunk, timestamp)| {
                        let axis = |i: usize| {
                            let v = f32::from_le_bytes([
                                chunk[i],
                                chunk[i + 1],
                                chunk[i + 2],
                                chunk[i + 3],
                            ]);
                            v as f64 * 1000.0 / STANDARD_GRAVITY
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
        }
    }
}

/// Validate a GSP data frame and return its sample bytes.
///
/// Returns `None` for command results and for frames tagged with another
/// subscription's reference.
fn data_body(
    kind: StreamKind,
    payload: &[u8],
    reference: u8,
    sample_bytes: usize,
) -> Result<Option<&[u8]>> {
    match payload {
        [response::DATA, r, ..] if *r == reference => {}
        [_, _, ..] => return Ok(None),
        _ => return Err(HrmError::malformed(kind, payload, "truncated GSP header")),
    }
    if payload.len() < HEADER_LEN + sample_bytes {
        return Err(HrmError::malformed(
            kind,
            payload,
            format!("need at least {} bytes", HEADER_LEN + sample_bytes),
        ));
    }
    let body = &payload[HEADER_LEN..];
    if body.len() % sample_bytes != 0 {
        return Err(HrmError::malformed(
            kind,
            payload,
            format!("{} sample bytes is not a multiple of {}", body.len(), sample_bytes),
        ));
    }
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(reference: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![response::DATA, reference];
        frame.extend_from_slice(&42_000u32.to_le_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_subscribe_command_names_resource() {
        let writes = Movesense.start_commands(StreamKind::Ecg);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].characteristic, GSP_COMMAND_UUID);
        assert_eq!(&writes[0].value[..2], &[op::SUBSCRIBE, ECG_REFERENCE]);
        assert_eq!(&writes[0].value[2..], b"/Meas/ECG/125");
    }

    #[test]
    fn test_ecg_frame() {
        let mut body = Vec::new();
        for raw in [1_000i32, -2_000, 0, 4] {
            body.extend_from_slice(&raw.to_le_bytes());
        }
        let samples = Movesense
            .decode(StreamKind::Ecg, GSP_DATA_UUID, &frame(ECG_REFERENCE, &body), 3.0)
            .unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[3].timestamp(), 3.0);
        match samples[1] {
            SampleRecord::Ecg(e) => assert!((e.microvolts + 2_000.0 * ECG_SCALE).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_acc_frame_in_milli_g() {
        let mut body = Vec::new();
        for v in [0.0f32, 0.0, 9.80665] {
            body.extend_from_slice(&v.to_le_bytes());
        }
        let samples = Movesense
            .decode(StreamKind::Acc, GSP_DATA_UUID, &frame(ACC_REFERENCE, &body), 1.0)
            .unwrap();
        match samples.as_slice() {
            [SampleRecord::Acc(acc)] => {
                assert_eq!(acc.x_mg, 0.0);
                assert!((acc.z_mg - 1_000.0).abs() < 0.01);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_frames_for_other_reference_are_skipped() {
        let body = [0u8; 12];
        let samples = Movesense
            .decode(StreamKind::Ecg, GSP_DATA_UUID, &frame(ACC_REFERENCE, &body), 1.0)
            .unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_partial_sample_is_malformed() {
        let result = Movesense.decode(
            StreamKind::Ecg,
            GSP_DATA_UUID,
            &frame(ECG_REFERENCE, &[1, 2, 3, 4, 5]),
            1.0,
        );
        assert!(matches!(result, Err(HrmError::MalformedPayload { .. })));
    }
}
