//! Garmin HRM Pro Protocol
//!
//! Only the standard Heart Rate Measurement characteristic is exposed to
//! third parties. The strap reports RR values that are used as milliseconds.

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{DeviceType, SampleRecord, StreamKind, Timestamp};
use crate::error::Result;
use crate::protocol::heart_rate::{self, RrResolution};
use crate::protocol::HEART_RATE_MEASUREMENT_UUID;
use std::collections::BTreeSet;
use uuid::Uuid;

const STREAM_KINDS: &[StreamKind] = &[StreamKind::Ibi];

#[derive(Debug, Default)]
pub struct GarminHrmPro;

impl DecoderProfile for GarminHrmPro {
    const DEVICE_TYPE: DeviceType = DeviceType("GarminHRMPro");
    const STREAM_KINDS: &'static [StreamKind] = STREAM_KINDS;

    fn is_supported(device_name: &str) -> bool {
        device_name.contains("HRM-Pro")
    }
}

impl DeviceDecoder for GarminHrmPro {
    fn device_type(&self) -> DeviceType {
        Self::DEVICE_TYPE
    }

    fn stream_kinds(&self) -> &'static [StreamKind] {
        STREAM_KINDS
    }

    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>> {
        match kind {
            StreamKind::Ibi => Ok(BTreeSet::from([HEART_RATE_MEASUREMENT_UUID])),
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
            other => Err(self.unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HrmError;

    #[test]
    fn test_name_matching() {
        assert!(GarminHrmPro::is_supported("HRM-Pro:982040"));
        assert!(!GarminHrmPro::is_supported("HRM-Dual:1234"));
    }

    #[test]
    fn test_only_ibi_is_supported() {
        let decoder = GarminHrmPro;
        assert!(decoder.supports(StreamKind::Ibi));
        assert!(matches!(
            decoder.required_characteristics(StreamKind::Ecg),
            Err(HrmError::UnsupportedStreamKind {
                kind: StreamKind::Ecg,
                ..
            })
        ));
    }

    #[test]
    fn test_rr_values_are_millis() {
        // u8 rate 75, RR 800 ms
        let payload = [0x10, 75, 0x20, 0x03];
        let samples = GarminHrmPro
            .decode(StreamKind::Ibi, HEART_RATE_MEASUREMENT_UUID, &payload, 5.0)
            .unwrap();
        assert_eq!(samples.len(), 1);
        match samples[0] {
            SampleRecord::Ibi(ibi) => assert_eq!(ibi.ibi_ms, 800.0),
            other => panic!("unexpected {other:?}"),
        }
    }
}
