//! Device Information (0x180A) and Battery (0x180F) characteristics

use super::sig_uuid;
use uuid::Uuid;

/// Model Number String
pub const MODEL_NUMBER_UUID: Uuid = sig_uuid(0x2A24);

/// Manufacturer Name String
pub const MANUFACTURER_NAME_UUID: Uuid = sig_uuid(0x2A29);

/// Battery Level, one byte in percent
pub const BATTERY_LEVEL_UUID: Uuid = sig_uuid(0x2A19);

/// Decode a UTF-8 string characteristic. Some straps pad with NULs.
pub fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Battery level in percent; `None` for an empty or out-of-range value.
pub fn decode_battery_level(value: &[u8]) -> Option<u8> {
    value.first().copied().filter(|level| *level <= 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string_strips_padding() {
        assert_eq!(decode_string(b"H10\0\0"), "H10");
        assert_eq!(decode_string(b"Polar Electro Oy"), "Polar Electro Oy");
        assert_eq!(decode_string(&[]), "");
    }

    #[test]
    fn test_decode_battery_level() {
        assert_eq!(decode_battery_level(&[87]), Some(87));
        assert_eq!(decode_battery_level(&[0xFF]), None);
        assert_eq!(decode_battery_level(&[]), None);
    }

    #[test]
    fn test_uuids_expand_sig_numbers() {
        assert_eq!(
            BATTERY_LEVEL_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }
}
