//! Chileaf CL800 Protocol
//!
//! RR intervals use the standard HRM characteristic. The accelerometer is
//! exposed on the vendor service and must be switched on with a command
//! written to the vendor write characteristic.
//!
//! # Vendor Frame Structure
//!
//! ```text
//! [0]       : Header (0xFF)
//! [1]       : Total frame length including header and checksum
//! [2]       : Command (0x0C = accelerometer)
//! [3..n-1]  : Samples, i16 little-endian x/y/z, 1/4096 g per LSB
//! [n-1]     : Checksum, makes the wrapping byte sum of the frame zero
//! ```

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{AccSample, DeviceType, GattWrite, SampleRecord, StreamKind, Timestamp};
use crate::error::{HrmError, Result};
use crate::protocol::heart_rate::{self, RrResolution};
use crate::protocol::{spread_timestamps, HEART_RATE_MEASUREMENT_UUID};
use std::collections::BTreeSet;
use tracing::trace;
use uuid::{uuid, Uuid};

pub const VENDOR_SERVICE_UUID: Uuid = uuid!("aae28f00-71b5-42a1-8c3c-f9cf6ac969d0");
pub const VENDOR_WRITE_UUID: Uuid = uuid!("aae28f01-71b5-42a1-8c3c-f9cf6ac969d0");
pub const VENDOR_NOTIFY_UUID: Uuid = uuid!("aae28f02-71b5-42a1-8c3c-f9cf6ac969d0");

pub const ACC_SAMPLE_RATE: f64 = 25.0;

/// Milli-g per raw count (±8 g range)
pub const ACC_SCALE: f64 = 1000.0 / 4096.0;

const HEADER: u8 = 0xFF;
const ACC_COMMAND: u8 = 0x0C;
const SAMPLE_BYTES: usize = 6;
const MIN_FRAME_LEN: usize = 3 + SAMPLE_BYTES + 1;

const STREAM_KINDS: &[StreamKind] = &[StreamKind::Ibi, StreamKind::Acc];

/// Longest body whose frame length still fits the length byte.
pub const MAX_BODY_LEN: usize = u8::MAX as usize - 4;

/// Frame a vendor command, appending length and checksum.
///
/// # Panics
///
/// If `body` is longer than [`MAX_BODY_LEN`].
pub fn vendor_frame(command: u8, body: &[u8]) -> Vec<u8> {
    assert!(
        body.len() <= MAX_BODY_LEN,
        "CL800 frame body of {} bytes exceeds {MAX_BODY_LEN}",
        body.len()
    );
    let mut frame = vec![HEADER, (body.len() + 4) as u8, command];
    frame.extend_from_slice(body);
    frame.push(checksum(&frame));
    frame
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_sub(*b))
}

#[derive(Debug, Default)]
pub struct Cl800;

impl DecoderProfile for Cl800 {
    const DEVICE_TYPE: DeviceType = DeviceType("CL800");
    const STREAM_KINDS: &'static [StreamKind] = STREAM_KINDS;

    fn is_supported(device_name: &str) -> bool {
        device_name.contains("CL800")
    }
}

impl DeviceDecoder for Cl800 {
    fn device_type(&self) -> DeviceType {
        Self::DEVICE_TYPE
    }

    fn stream_kinds(&self) -> &'static [StreamKind] {
        STREAM_KINDS
    }

    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>> {
        match kind {
            StreamKind::Ibi => Ok(BTreeSet::from([HEART_RATE_MEASUREMENT_UUID])),
            StreamKind::Acc => Ok(BTreeSet::from([VENDOR_NOTIFY_UUID])),
            other => Err(self.unsupported(other)),
        }
    }

    fn start_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        match kind {
            StreamKind::Acc => vec![GattWrite::new(
                VENDOR_WRITE_UUID,
                vendor_frame(ACC_COMMAND, &[0x01]),
            )],
            _ => Vec::new(),
        }
    }

    fn stop_commands(&self, kind: StreamKind) -> Vec<GattWrite> {
        match kind {
            StreamKind::Acc => vec![GattWrite::new(
                VENDOR_WRITE_UUID,
                vendor_frame(ACC_COMMAND, &[0x00]),
            )],
            _ => Vec::new(),
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
            StreamKind::Ibi => heart_rate::decode_ibi(payload, RrResolution::Units1024, received_at),
            StreamKind::Acc => decode_acc(payload, received_at),
            other => Err(self.unsupported(other)),
        }
    }
}

pub fn decode_acc(payload: &[u8], received_at: Timestamp) -> Result<Vec<SampleRecord>> {
    let malformed = |reason: String| HrmError::malformed(StreamKind::Acc, payload, reason);

    match payload {
        [HEADER, _, ACC_COMMAND, ..] => {}
        [HEADER, _, command, ..] => {
            trace!("Ignoring CL800 vendor frame for command {:#04x}", command);
            return Ok(Vec::new());
        }
        _ => return Err(malformed("missing frame header".to_string())),
    }
    if payload.len() < MIN_FRAME_LEN {
        return Err(malformed(format!("need at least {MIN_FRAME_LEN} bytes")));
    }
    if payload[1] as usize != payload.len() {
        return Err(malformed(format!(
            "length byte says {} bytes",
            payload[1]
        )));
    }
    if checksum(payload) != 0 {
        return Err(malformed("checksum mismatch".to_string()));
    }

    let body = &payload[3..payload.len() - 1];
    if body.len() % SAMPLE_BYTES != 0 {
        return Err(malformed(format!(
            "{} sample bytes is not a multiple of {SAMPLE_BYTES}",
            body.len()
        )));
    }

    let chunks = body.chunks_exact(SAMPLE_BYTES);
    let timestamps = spread_timestamps(received_at, chunks.len(), ACC_SAMPLE_RATE);
    Ok(chunks
        .zip(timestamps)
        .map(|(chunk, timestamp)| {
            let axis = |i: usize| i16::from_le_bytes([chunk[i], chunk[i + 1]]) as f64 * ACC_SCALE;
            SampleRecord::Acc(AccSample {
                timestamp,
                x_mg: axis(0),
                y_mg: axis(2),
                z_mg: axis(4),
            })
        })
        .collect())
}
