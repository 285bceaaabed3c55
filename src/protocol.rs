//! GATT UUIDs, PMD wire constants, and control-frame codecs for Polar
//! heart monitors.
//!
//! Two GATT surfaces are involved:
//!
//! * the standard Heart Rate and Battery services (`0x180D`/`0x180F`),
//! * the vendor Polar Measurement Data (PMD) service in the
//!   `FB005C8X-02E7-F387-1CAD-8ACD2D8DF0C8` namespace, with a writable +
//!   notifiable control point and a notify-only data characteristic.
//!
//! Everything in this module is a bit-exact wire contract: byte order is
//! little-endian throughout, timestamps are nanoseconds, and the request/
//! response layouts must match the firmware exactly.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::error::Error;
use crate::types::{ControlResponse, MeasurementType, PmdSetting, PmdStatus, SettingsMap};

// ── Standard services ─────────────────────────────────────────────────────────

/// Standard Heart Rate service.
#[allow(dead_code)]
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (notify). Wire format decoded by
/// [`crate::parse::decode_heart_rate`].
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Standard Battery service.
#[allow(dead_code)]
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (read): a single byte, percent 0–100.
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

// ── PMD service ───────────────────────────────────────────────────────────────

/// Polar Measurement Data service UUID.
#[allow(dead_code)]
pub const PMD_SERVICE: Uuid = Uuid::from_u128(0xfb005c80_02e7_f387_1cad_8acd2d8df0c8);

/// PMD control point (write + notify). Commands go in, acknowledgements
/// and settings come back; reading it yields the feature bitmask parsed
/// by [`parse_feature_bitmask`].
pub const PMD_CONTROL: Uuid = Uuid::from_u128(0xfb005c81_02e7_f387_1cad_8acd2d8df0c8);

/// PMD data characteristic (notify). Every notification is one complete
/// streaming frame, decoded by [`crate::parse::decode_pmd_frame`].
pub const PMD_DATA: Uuid = Uuid::from_u128(0xfb005c82_02e7_f387_1cad_8acd2d8df0c8);

// ── Control-point opcodes and framing ─────────────────────────────────────────

/// Request the legal settings for a measurement type.
pub const OP_GET_SETTINGS: u8 = 0x01;
/// Start streaming a measurement type.
pub const OP_START_STREAM: u8 = 0x02;
/// Stop streaming a measurement type.
pub const OP_STOP_STREAM: u8 = 0x03;

/// First byte of every control-point response notification.
pub const CONTROL_RESPONSE_HEADER: u8 = 0xF0;

/// First byte of the feature bitmask obtained by *reading* the control
/// point.
pub const FEATURE_READ_HEADER: u8 = 0x0F;

/// Encode a settings query: `[0x01, type]`.
pub fn encode_settings_request(measurement: MeasurementType) -> Vec<u8> {
    vec![OP_GET_SETTINGS, measurement.tag()]
}

/// Encode a start-streaming request.
///
/// Layout: `[0x02, type]` followed by one parameter block per chosen
/// setting, in the caller's order:
///
/// ```text
/// [setting_id, value_count (= 0x01), value_lo, value_hi]
/// ```
///
/// Each block carries exactly one chosen u16 value; the device answers
/// with `invalid parameter` if the value is not among those it
/// advertised.
pub fn encode_start_request(
    measurement: MeasurementType,
    settings: &[(PmdSetting, u16)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + settings.len() * 4);
    out.push(OP_START_STREAM);
    out.push(measurement.tag());
    for &(setting, value) in settings {
        out.push(setting.id());
        out.push(0x01);
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Encode a stop-streaming request: `[0x03, type]`.
pub fn encode_stop_request(measurement: MeasurementType) -> Vec<u8> {
    vec![OP_STOP_STREAM, measurement.tag()]
}

/// Decode a control-point response notification.
///
/// Layout:
///
/// ```text
/// byte 0    : 0xF0 response header
/// byte 1    : echoed opcode
/// byte 2    : echoed measurement-type tag
/// byte 3    : status code (0 = success)
/// byte 4    : "more frames follow" flag (optional)
/// bytes 5.. : payload (optional)
/// ```
pub fn decode_control_response(data: &[u8]) -> Result<ControlResponse, Error> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "control response of {} bytes is shorter than the 4-byte header",
            data.len()
        )));
    }
    if data[0] != CONTROL_RESPONSE_HEADER {
        return Err(Error::Protocol(format!(
            "control response starts with 0x{:02x}, expected 0x{CONTROL_RESPONSE_HEADER:02x}",
            data[0]
        )));
    }
    let measurement = MeasurementType::from_tag(data[2]).ok_or_else(|| {
        Error::Protocol(format!(
            "control response echoes unknown measurement tag 0x{:02x}",
            data[2]
        ))
    })?;
    Ok(ControlResponse {
        opcode: data[1],
        measurement,
        status: PmdStatus(data[3]),
        more: data.get(4).copied().unwrap_or(0) != 0,
        payload: data.get(5..).unwrap_or_default().to_vec(),
    })
}

/// Parse a settings-query payload into a [`SettingsMap`].
///
/// The payload is a sequence of parameter blocks:
///
/// ```text
/// [setting_id, value_count, value_0_lo, value_0_hi, value_1_lo, …]
/// ```
///
/// Unknown setting ids are skipped (newer firmware advertises ids this
/// crate does not negotiate); a block running past the payload end is a
/// protocol error.
pub fn parse_settings_payload(payload: &[u8]) -> Result<SettingsMap, Error> {
    let mut map: SettingsMap = BTreeMap::new();
    let mut offset = 0;
    while offset < payload.len() {
        if offset + 2 > payload.len() {
            return Err(Error::Protocol(format!(
                "settings block header truncated at offset {offset}"
            )));
        }
        let id = payload[offset];
        let count = payload[offset + 1] as usize;
        let end = offset + 2 + count * 2;
        if end > payload.len() {
            return Err(Error::Protocol(format!(
                "settings block for id 0x{id:02x} declares {count} values but payload ends early"
            )));
        }
        let values = payload[offset + 2..end]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        match PmdSetting::from_id(id) {
            Some(setting) => {
                map.entry(setting).or_default().extend(values);
            }
            None => {
                log::debug!("skipping unknown setting id 0x{id:02x} ({count} values)");
            }
        }
        offset = end;
    }
    Ok(map)
}

/// Parse the feature bitmask obtained by reading the PMD control point.
///
/// ```text
/// byte 0 : 0x0F header
/// byte 1 : feature bits — 0x01 ECG, 0x02 PPG, 0x04 ACC, 0x08 PPI,
///          0x20 gyroscope, 0x40 magnetometer, 0x80 SDK mode
/// ```
pub fn parse_feature_bitmask(data: &[u8]) -> Result<BTreeSet<MeasurementType>, Error> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "feature read of {} bytes is shorter than the 2-byte minimum",
            data.len()
        )));
    }
    if data[0] != FEATURE_READ_HEADER {
        return Err(Error::Protocol(format!(
            "feature read starts with 0x{:02x}, expected 0x{FEATURE_READ_HEADER:02x}",
            data[0]
        )));
    }
    let bits = data[1];
    let mut set = BTreeSet::new();
    for (mask, measurement) in [
        (0x01, MeasurementType::Ecg),
        (0x02, MeasurementType::Ppg),
        (0x04, MeasurementType::Acc),
        (0x08, MeasurementType::Ppi),
        (0x20, MeasurementType::Gyro),
        (0x40, MeasurementType::Mag),
        (0x80, MeasurementType::SdkMode),
    ] {
        if bits & mask != 0 {
            set.insert(measurement);
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_layout() {
        let req = encode_start_request(
            MeasurementType::Ppg,
            &[
                (PmdSetting::SampleRate, 176),
                (PmdSetting::Channels, 4),
                (PmdSetting::Resolution, 22),
            ],
        );
        assert_eq!(
            req,
            vec![
                0x02, 0x01, // start PPG
                0x00, 0x01, 0xB0, 0x00, // SAMPLE_RATE = 176
                0x04, 0x01, 0x04, 0x00, // CHANNELS = 4
                0x01, 0x01, 0x16, 0x00, // RESOLUTION = 22
            ]
        );
    }

    #[test]
    fn stop_and_settings_requests() {
        assert_eq!(encode_stop_request(MeasurementType::Ecg), vec![0x03, 0x00]);
        assert_eq!(
            encode_settings_request(MeasurementType::Acc),
            vec![0x01, 0x02]
        );
    }

    #[test]
    fn control_response_roundtrip() {
        let resp =
            decode_control_response(&[0xF0, 0x02, 0x00, 0x00, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(resp.opcode, OP_START_STREAM);
        assert_eq!(resp.measurement, MeasurementType::Ecg);
        assert!(resp.status.is_success());
        assert!(!resp.more);
        assert_eq!(resp.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn control_response_device_error() {
        let resp = decode_control_response(&[0xF0, 0x02, 0x01, 0x05]).unwrap();
        assert_eq!(resp.status, PmdStatus(5));
        assert_eq!(resp.status.message(), "invalid parameter");
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn control_response_bad_header() {
        assert!(decode_control_response(&[0xF1, 0x02, 0x00, 0x00]).is_err());
        assert!(decode_control_response(&[0xF0, 0x02]).is_err());
    }

    #[test]
    fn settings_payload_parses_blocks() {
        // SAMPLE_RATE {130}, RESOLUTION {14}, unknown id 0x07 skipped
        let payload = [
            0x00, 0x01, 130, 0, //
            0x01, 0x01, 14, 0, //
            0x07, 0x02, 1, 0, 2, 0,
        ];
        let map = parse_settings_payload(&payload).unwrap();
        assert_eq!(map.len(), 2);
        assert!(map[&PmdSetting::SampleRate].contains(&130));
        assert!(map[&PmdSetting::Resolution].contains(&14));
    }

    #[test]
    fn settings_payload_truncated_block() {
        assert!(parse_settings_payload(&[0x00, 0x03, 130, 0]).is_err());
    }

    #[test]
    fn feature_bitmask() {
        // H10 advertises ECG + ACC + PPI
        let set = parse_feature_bitmask(&[0x0F, 0x01 | 0x04 | 0x08]).unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![
                MeasurementType::Ecg,
                MeasurementType::Acc,
                MeasurementType::Ppi
            ]
        );
        assert!(parse_feature_bitmask(&[0x00, 0xFF]).is_err());
    }
}
