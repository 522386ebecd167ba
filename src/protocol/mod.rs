//! Device protocols
//!
//! Wire formats for every supported heart-rate monitor, plus the pieces they
//! share.
//!
//! ## Modules
//!
//! - [`heart_rate`] - Standard Heart Rate Measurement characteristic (0x2A37)
//! - [`polar_h10`] - Polar H10 (HRM + PMD ECG/ACC)
//! - [`garmin_hrm_pro`] - Garmin HRM Pro (HRM only)
//! - [`movesense`] - Movesense (HRM + GSP ECG/ACC)
//! - [`cl800`] - Chileaf CL800 (HRM + vendor ACC)
//! - [`mock_sensor`] - Synthetic strap for running without hardware
//! - [`device_info`] - Device Information and Battery characteristics

pub mod cl800;
pub mod device_info;
pub mod garmin_hrm_pro;
pub mod heart_rate;
pub mod mock_sensor;
pub mod movesense;
pub mod polar_h10;

use crate::domain::models::Timestamp;
use uuid::Uuid;

/// Expand a 16-bit SIG-assigned number onto the Bluetooth base UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Heart Rate service.
pub const HEART_RATE_SERVICE_UUID: Uuid = sig_uuid(0x180D);

/// Heart Rate Measurement characteristic.
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = sig_uuid(0x2A37);

/// Standard gravity, for converting m/s² to milli-g.
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Timestamps for `count` evenly spaced samples whose last one was received
/// at `received_at`.
pub fn spread_timestamps(
    received_at: Timestamp,
    count: usize,
    sample_rate_hz: f64,
) -> impl Iterator<Item = Timestamp> {
    let period = 1.0 / sample_rate_hz;
    (0..count).map(move |i| received_at - (count - 1 - i) as f64 * period)
}

/// Sign-extending little-endian read of a 1-, 2- or 3-byte integer.
pub(crate) fn read_signed_le(bytes: &[u8]) -> i32 {
    let width = bytes.len();
    let mut raw: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        raw |= (*b as u32) << (8 * i);
    }
    let shift = 32 - 8 * width as u32;
    ((raw << shift) as i32) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sig_uuid() {
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_spread_timestamps_end_at_receipt() {
        let stamps: Vec<_> = spread_timestamps(100.0, 4, 4.0).collect();
        assert_eq!(stamps, vec![99.25, 99.5, 99.75, 100.0]);
    }

    #[test]
    fn test_read_signed_le() {
        assert_eq!(read_signed_le(&[0xFF]), -1);
        assert_eq!(read_signed_le(&[0x00, 0x80]), -32768);
        assert_eq!(read_signed_le(&[0x10, 0x27, 0x00]), 10_000);
        assert_eq!(read_signed_le(&[0xF0, 0xD8, 0xFF]), -10_000);
    }
}
