//! Binary decoders for PMD streaming frames and the standard heart-rate
//! characteristic.
//!
//! All public functions in this module are pure (no I/O, no state beyond
//! the returned collections) and safe to call from any async or sync
//! context. A decode failure is reported as a [`FrameError`] and affects
//! only the offending frame — the caller is expected to skip it and keep
//! the stream alive.
//!
//! # PMD frame layout
//!
//! Every data-characteristic notification is one complete frame:
//!
//! ```text
//! byte 0      : measurement-type tag
//! bytes 1–8   : u64 LE device timestamp in ns, of the LAST sample
//! byte 9      : frame type — bit 7 set = delta-compressed,
//!               low bits select the per-type sample width
//! bytes 10..  : payload
//! ```
//!
//! | Type | Frame type | Channels | Sample width | Unit |
//! |---|---|---|---|---|
//! | ECG | 0x00 | 1 | 3 B | µV |
//! | PPG | 0x00 | 4 | 3 B | raw ADC |
//! | ACC | 0x00 / 0x01 / 0x02 | 3 | 1 / 2 / 3 B | mG |
//!
//! Raw payloads are fixed-width signed little-endian integers with the
//! channels of each sample consecutive. Delta payloads carry one
//! full-width reference sample per channel (the frame's first sample),
//! then any number of `[delta_bits, sample_count, packed bits]` blocks;
//! a frame may mix block widths, e.g. a narrow run plus a wider "escape"
//! block for occasional large jumps.

use log::debug;

use crate::error::FrameError;
use crate::types::{
    ContactStatus, DataFrame, HeartRateFrame, HrPacket, MeasurementType, SampleData,
};

// ── Integer helpers ───────────────────────────────────────────────────────────

/// Sign-extend the low `bits` bits of `value`.
fn sign_extend(value: u32, bits: u32) -> i32 {
    if bits >= 32 {
        return value as i32;
    }
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Read a signed little-endian integer of 1–4 bytes.
fn read_signed_le(bytes: &[u8]) -> i32 {
    let mut value = 0u32;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as u32) << (8 * i);
    }
    sign_extend(value, (bytes.len() * 8) as u32)
}

/// Unpack `count` signed `bit_width`-bit integers from a packed slice.
///
/// Bits are consumed LSB-first, byte by byte — the packing the firmware
/// uses for delta blocks. Values are two's-complement sign-extended.
fn unpack_signed_bits(data: &[u8], bit_width: usize, count: usize) -> Vec<i32> {
    (0..count)
        .map(|i| {
            let mut val = 0u32;
            for bit in 0..bit_width {
                let total = i * bit_width + bit;
                let byte = total / 8;
                if byte < data.len() && (data[byte] >> (total % 8)) & 1 != 0 {
                    val |= 1 << bit;
                }
            }
            sign_extend(val, bit_width as u32)
        })
        .collect()
}

// ── PMD frame decoding ────────────────────────────────────────────────────────

/// Decode one PMD data-characteristic notification into a [`DataFrame`].
///
/// Zero-sample frames (keepalives) decode to an empty sample sequence,
/// not an error. Unknown tags or frame types, payload lengths that do
/// not divide into whole sample tuples, and truncated delta blocks all
/// fail with a [`FrameError`] for this frame only.
pub fn decode_pmd_frame(data: &[u8]) -> Result<DataFrame, FrameError> {
    if data.len() < 10 {
        return Err(FrameError::TooShort(data.len()));
    }
    let measurement =
        MeasurementType::from_tag(data[0]).ok_or(FrameError::UnknownType(data[0]))?;
    let timestamp_ns = u64::from_le_bytes([
        data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
    ]);
    let frame_type = data[9];
    let compressed = frame_type & 0x80 != 0;

    let (channels, sample_bytes) = match (measurement, frame_type & 0x7F) {
        (MeasurementType::Ecg, 0x00) => (1, 3),
        (MeasurementType::Ppg, 0x00) => (4, 3),
        (MeasurementType::Acc, 0x00) => (3, 1),
        (MeasurementType::Acc, 0x01) => (3, 2),
        (MeasurementType::Acc, 0x02) => (3, 3),
        _ => {
            return Err(FrameError::UnknownFrameType {
                measurement,
                frame_type,
            })
        }
    };

    let payload = &data[10..];
    let flat = if compressed {
        decode_delta_samples(payload, channels, sample_bytes)?
    } else {
        decode_raw_samples(payload, channels, sample_bytes)?
    };

    let samples = match measurement {
        MeasurementType::Ecg => SampleData::Ecg(flat),
        MeasurementType::Acc => SampleData::Acc(
            flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        ),
        MeasurementType::Ppg => SampleData::Ppg(
            flat.chunks_exact(4)
                .map(|c| [c[0], c[1], c[2], c[3]])
                .collect(),
        ),
        _ => {
            return Err(FrameError::UnknownFrameType {
                measurement,
                frame_type,
            })
        }
    };

    Ok(DataFrame {
        measurement,
        timestamp_ns,
        samples,
    })
}

/// Decode a raw (uncompressed) payload into channel values, sample-major.
fn decode_raw_samples(
    payload: &[u8],
    channels: usize,
    sample_bytes: usize,
) -> Result<Vec<i32>, FrameError> {
    let stride = channels * sample_bytes;
    if payload.len() % stride != 0 {
        return Err(FrameError::RaggedPayload {
            len: payload.len(),
            stride,
        });
    }
    Ok(payload.chunks_exact(sample_bytes).map(read_signed_le).collect())
}

/// Decode a delta-compressed payload into channel values, sample-major.
///
/// The reference sample is the frame's first sample; each subsequent
/// sample is the previous one plus that block's per-channel delta,
/// accumulated independently per channel, so reconstruction is exact for
/// any run length and any mix of block widths.
fn decode_delta_samples(
    payload: &[u8],
    channels: usize,
    sample_bytes: usize,
) -> Result<Vec<i32>, FrameError> {
    if payload.is_empty() {
        // keepalive
        return Ok(Vec::new());
    }
    let ref_bytes = channels * sample_bytes;
    if payload.len() < ref_bytes {
        return Err(FrameError::TruncatedDelta(0));
    }
    let mut prev: Vec<i32> = payload[..ref_bytes]
        .chunks_exact(sample_bytes)
        .map(read_signed_le)
        .collect();
    let mut samples = prev.clone();

    let mut offset = ref_bytes;
    while offset < payload.len() {
        if offset + 2 > payload.len() {
            return Err(FrameError::TruncatedDelta(offset));
        }
        let delta_bits = payload[offset];
        let count = payload[offset + 1] as usize;
        offset += 2;
        if delta_bits == 0 || delta_bits > 32 {
            return Err(FrameError::BadDeltaWidth(delta_bits));
        }
        let total = count * channels;
        let packed_len = (total * delta_bits as usize + 7) / 8;
        if offset + packed_len > payload.len() {
            return Err(FrameError::TruncatedDelta(offset));
        }
        let deltas = unpack_signed_bits(&payload[offset..offset + packed_len], delta_bits as usize, total);
        offset += packed_len;

        for tuple in deltas.chunks_exact(channels) {
            for (ch, &d) in tuple.iter().enumerate() {
                prev[ch] = prev[ch].wrapping_add(d);
            }
            samples.extend_from_slice(&prev);
        }
    }
    Ok(samples)
}

// ── Heart-rate characteristic decoding ────────────────────────────────────────

/// Consume `n` bytes of a notification, tracking the cursor.
fn field<'a>(data: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8], FrameError> {
    let end = *offset + n;
    if end > data.len() {
        return Err(FrameError::TooShort(data.len()));
    }
    let out = &data[*offset..end];
    *offset = end;
    Ok(out)
}

/// Convert a raw RR interval (units of 1/1024 s) to milliseconds,
/// rounded to nearest.
pub fn rr_raw_to_ms(raw: u16) -> u16 {
    ((raw as u32 * 1000 + 512) / 1024) as u16
}

/// Decode one standard heart-rate measurement notification.
///
/// Byte 0 is a flags mask:
///
/// | Bit | Meaning |
/// |---|---|
/// | 0 | bpm field is u16 LE (else u8) |
/// | 1–2 | sensor contact: `1x` supported, bit 1 = contact detected |
/// | 3 | u16 LE energy expenditure (kJ) present |
/// | 4 | u16 LE RR intervals (1/1024 s) fill the remainder |
///
/// Fields follow in fixed order — bpm, energy if flagged, then RR
/// intervals; the RR count is derived from the remaining length, it is
/// never transmitted explicitly.
pub fn decode_heart_rate(data: &[u8]) -> Result<HrPacket, FrameError> {
    if data.is_empty() {
        return Err(FrameError::TooShort(0));
    }
    let flags = data[0];
    let mut offset = 1;

    let bpm = if flags & 0x01 != 0 {
        let b = field(data, &mut offset, 2)?;
        u16::from_le_bytes([b[0], b[1]])
    } else {
        field(data, &mut offset, 1)?[0] as u16
    };

    let contact = match (flags >> 1) & 0x03 {
        0b10 => ContactStatus::NoContact,
        0b11 => ContactStatus::Contact,
        _ => ContactStatus::Unsupported,
    };

    let energy_kj = if flags & 0x08 != 0 {
        let b = field(data, &mut offset, 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    } else {
        None
    };

    let mut rr_ms = Vec::new();
    if flags & 0x10 != 0 {
        let remainder = data.len() - offset;
        if remainder % 2 != 0 {
            return Err(FrameError::RaggedPayload {
                len: remainder,
                stride: 2,
            });
        }
        while offset < data.len() {
            let b = field(data, &mut offset, 2)?;
            rr_ms.push(rr_raw_to_ms(u16::from_le_bytes([b[0], b[1]])));
        }
    } else if offset < data.len() {
        debug!(
            "ignoring {} trailing bytes in heart-rate notification (flags 0x{flags:02x})",
            data.len() - offset
        );
    }

    Ok(HrPacket {
        bpm,
        contact,
        energy_kj,
        rr_ms,
    })
}

/// Explode one heart-rate packet into per-RR-interval frames (unpacked
/// delivery).
///
/// Timestamps are synthesized by walking backward from the notification
/// arrival time through the cumulative interval durations: the last
/// interval keeps the arrival time, earlier frames subtract the reversed
/// cumulative sums of `rr[1..]`. This is an approximation — it ignores
/// transport jitter — and is preserved as-is rather than corrected.
///
/// With `instant_rate`, each frame's bpm is `round(60000 / rr_ms)` for
/// its own interval instead of the device-reported average.
///
/// A packet with no RR intervals yields a single frame stamped with the
/// arrival time (there is nothing to unpack, but the bpm and contact
/// fields are still worth delivering).
pub fn unpack_rr_frames(
    packet: &HrPacket,
    arrival_ns: u64,
    instant_rate: bool,
) -> Vec<HeartRateFrame> {
    let rr = &packet.rr_ms;
    if rr.is_empty() {
        return vec![packet.clone().into_frame(arrival_ns)];
    }
    let n = rr.len();
    let mut cums = Vec::with_capacity(n - 1);
    let mut acc = 0u64;
    for &r in &rr[1..] {
        acc += r as u64;
        cums.push(acc);
    }
    (0..n)
        .map(|i| {
            let offset_ms = if i + 1 == n { 0 } else { cums[n - 2 - i] };
            let rr_i = rr[i];
            let bpm = if instant_rate && rr_i > 0 {
                ((60_000 + rr_i as u32 / 2) / rr_i as u32) as u16
            } else {
                packet.bpm
            };
            HeartRateFrame {
                timestamp_ns: arrival_ns.saturating_sub(offset_ms * 1_000_000),
                bpm,
                contact: packet.contact,
                rr_ms: vec![rr_i],
                energy_kj: packet.energy_kj,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Frame builders (test-side encoders) ──────────────────────────────────

    fn write_signed_le(out: &mut Vec<u8>, value: i32, bytes: usize) {
        for i in 0..bytes {
            out.push((value >> (8 * i)) as u8);
        }
    }

    fn pack_signed_bits(values: &[i32], bit_width: usize) -> Vec<u8> {
        let mut out = vec![0u8; (values.len() * bit_width + 7) / 8];
        for (i, &v) in values.iter().enumerate() {
            for bit in 0..bit_width {
                if (v >> bit) & 1 != 0 {
                    let total = i * bit_width + bit;
                    out[total / 8] |= 1 << (total % 8);
                }
            }
        }
        out
    }

    fn frame_header(tag: u8, timestamp_ns: u64, frame_type: u8) -> Vec<u8> {
        let mut out = vec![tag];
        out.extend_from_slice(&timestamp_ns.to_le_bytes());
        out.push(frame_type);
        out
    }

    fn encode_raw_frame(
        tag: u8,
        timestamp_ns: u64,
        frame_type: u8,
        flat: &[i32],
        sample_bytes: usize,
    ) -> Vec<u8> {
        let mut out = frame_header(tag, timestamp_ns, frame_type);
        for &v in flat {
            write_signed_le(&mut out, v, sample_bytes);
        }
        out
    }

    /// Encode a delta frame: reference tuple plus `(width, flat deltas)`
    /// blocks. Delta slices must hold whole channel tuples.
    fn encode_delta_frame(
        tag: u8,
        timestamp_ns: u64,
        frame_type: u8,
        reference: &[i32],
        blocks: &[(u8, Vec<i32>)],
        sample_bytes: usize,
    ) -> Vec<u8> {
        let channels = reference.len();
        let mut out = frame_header(tag, timestamp_ns, frame_type | 0x80);
        for &v in reference {
            write_signed_le(&mut out, v, sample_bytes);
        }
        for (width, deltas) in blocks {
            assert_eq!(deltas.len() % channels, 0);
            out.push(*width);
            out.push((deltas.len() / channels) as u8);
            out.extend_from_slice(&pack_signed_bits(deltas, *width as usize));
        }
        out
    }

    // ── Raw frames ───────────────────────────────────────────────────────────

    #[test]
    fn ecg_raw_roundtrip() {
        let samples = [-3_742, 0, 1, 8_388_607, -8_388_608, 129];
        let data = encode_raw_frame(0x00, 112_233_445_566, 0x00, &samples, 3);
        let frame = decode_pmd_frame(&data).unwrap();
        assert_eq!(frame.measurement, MeasurementType::Ecg);
        assert_eq!(frame.timestamp_ns, 112_233_445_566);
        assert_eq!(frame.sample_count(), 6);
        assert_eq!(frame.samples, SampleData::Ecg(samples.to_vec()));
    }

    #[test]
    fn acc_raw_16bit_triplets() {
        let flat = [12, -56, 1001, -32768, 32767, 0];
        let data = encode_raw_frame(0x02, 7, 0x01, &flat, 2);
        let frame = decode_pmd_frame(&data).unwrap();
        assert_eq!(
            frame.samples,
            SampleData::Acc(vec![[12, -56, 1001], [-32768, 32767, 0]])
        );
    }

    #[test]
    fn ppg_raw_four_channel_tuples() {
        let flat = [100, 200, 300, 4, -100, -200, -300, 5];
        let data = encode_raw_frame(0x01, 99, 0x00, &flat, 3);
        let frame = decode_pmd_frame(&data).unwrap();
        assert_eq!(
            frame.samples,
            SampleData::Ppg(vec![[100, 200, 300, 4], [-100, -200, -300, 5]])
        );
    }

    #[test]
    fn keepalive_frames_are_empty_not_errors() {
        let raw = frame_header(0x00, 42, 0x00);
        assert_eq!(decode_pmd_frame(&raw).unwrap().sample_count(), 0);
        let delta = frame_header(0x02, 42, 0x81);
        let frame = decode_pmd_frame(&delta).unwrap();
        assert_eq!(frame.sample_count(), 0);
        assert_eq!(frame.timestamp_ns, 42);
    }

    #[test]
    fn ragged_payload_is_rejected() {
        // 4 payload bytes cannot hold whole 3-byte ECG samples
        let mut data = frame_header(0x00, 0, 0x00);
        data.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            decode_pmd_frame(&data),
            Err(FrameError::RaggedPayload { len: 4, stride: 3 })
        );
    }

    #[test]
    fn unknown_tag_and_frame_type() {
        let data = frame_header(0x04, 0, 0x00);
        assert_eq!(decode_pmd_frame(&data), Err(FrameError::UnknownType(0x04)));

        let data = frame_header(0x00, 0, 0x05);
        assert!(matches!(
            decode_pmd_frame(&data),
            Err(FrameError::UnknownFrameType {
                measurement: MeasurementType::Ecg,
                frame_type: 0x05
            })
        ));
    }

    #[test]
    fn short_frame() {
        assert_eq!(decode_pmd_frame(&[0x00, 1, 2]), Err(FrameError::TooShort(3)));
    }

    // ── Delta frames ─────────────────────────────────────────────────────────

    #[test]
    fn delta_single_level_reconstruction() {
        let deltas = vec![1, -2, 7, -8, 3];
        let data = encode_delta_frame(0x00, 5, 0x00, &[100], &[(4, deltas)], 3);
        let frame = decode_pmd_frame(&data).unwrap();
        // reference is the first sample; each delta accumulates
        assert_eq!(
            frame.samples,
            SampleData::Ecg(vec![100, 101, 99, 106, 98, 101])
        );
    }

    #[test]
    fn delta_two_level_escape_widths() {
        // A narrow run, then a wide "escape" block for a large jump,
        // then narrow again — all inside one frame.
        let data = encode_delta_frame(
            0x00,
            5,
            0x00,
            &[-500],
            &[
                (3, vec![2, -1, 3]),
                (16, vec![20_000, -12_345]),
                (2, vec![1, 1]),
            ],
            3,
        );
        let frame = decode_pmd_frame(&data).unwrap();
        let expected = vec![
            -500, -498, -499, -496, // width-3 run
            19_504, 7_159, // escape block
            7_160, 7_161, // width-2 run
        ];
        assert_eq!(frame.samples, SampleData::Ecg(expected));
    }

    #[test]
    fn delta_multichannel_accumulates_per_channel() {
        let data = encode_delta_frame(
            0x02,
            5,
            0x01,
            &[10, -20, 30],
            &[(5, vec![1, 2, -3, -10, 15, 0])],
            2,
        );
        let frame = decode_pmd_frame(&data).unwrap();
        assert_eq!(
            frame.samples,
            SampleData::Acc(vec![[10, -20, 30], [11, -18, 27], [1, -3, 27]])
        );
    }

    #[test]
    fn delta_long_run_exact() {
        // Ramp of 120 deltas of +1: no drift over the whole run.
        let deltas = vec![1i32; 120];
        let data = encode_delta_frame(0x00, 5, 0x00, &[0], &[(2, deltas)], 3);
        let frame = decode_pmd_frame(&data).unwrap();
        let expected: Vec<i32> = (0..=120).collect();
        assert_eq!(frame.samples, SampleData::Ecg(expected));
    }

    #[test]
    fn delta_truncated_and_bad_width() {
        let mut data = encode_delta_frame(0x00, 5, 0x00, &[100], &[(4, vec![1, 2, 3])], 3);
        data.pop();
        assert!(matches!(
            decode_pmd_frame(&data),
            Err(FrameError::TruncatedDelta(_))
        ));

        // header says 4 samples of width 0
        let mut data = frame_header(0x00, 5, 0x80);
        data.extend_from_slice(&[0, 0, 0]); // reference
        data.extend_from_slice(&[0, 4]); // block header
        assert_eq!(decode_pmd_frame(&data), Err(FrameError::BadDeltaWidth(0)));
    }

    // ── Heart rate ───────────────────────────────────────────────────────────

    #[test]
    fn hr_16bit_bpm_contact_energy_no_rr() {
        // 16-bit bpm, contact detected, energy present, no RR intervals
        let data = [0b0000_1111, 0x48, 0x01, 0x22, 0x01];
        let packet = decode_heart_rate(&data).unwrap();
        assert_eq!(packet.bpm, 0x0148);
        assert_eq!(packet.contact, ContactStatus::Contact);
        assert_eq!(packet.energy_kj, Some(0x0122));
        assert!(packet.rr_ms.is_empty());
    }

    #[test]
    fn hr_8bit_bpm_with_rr_intervals() {
        // 8-bit bpm, contact unsupported, RR present: raw units 1/1024 s
        let raw_800ms = 819u16.to_le_bytes();
        let raw_810ms = 829u16.to_le_bytes();
        let data = [
            0b0001_0000,
            72,
            raw_800ms[0],
            raw_800ms[1],
            raw_810ms[0],
            raw_810ms[1],
        ];
        let packet = decode_heart_rate(&data).unwrap();
        assert_eq!(packet.bpm, 72);
        assert_eq!(packet.contact, ContactStatus::Unsupported);
        assert_eq!(packet.energy_kj, None);
        assert_eq!(packet.rr_ms, vec![800, 810]);
    }

    #[test]
    fn hr_no_contact_flag() {
        let packet = decode_heart_rate(&[0b0000_0100, 60]).unwrap();
        assert_eq!(packet.contact, ContactStatus::NoContact);
    }

    #[test]
    fn hr_truncated_fields() {
        // flags promise a 16-bit bpm but only one byte follows
        assert_eq!(
            decode_heart_rate(&[0b0000_0001, 72]),
            Err(FrameError::TooShort(2))
        );
        // odd RR remainder
        assert!(matches!(
            decode_heart_rate(&[0b0001_0000, 72, 0x33]),
            Err(FrameError::RaggedPayload { .. })
        ));
    }

    #[test]
    fn rr_unit_conversion_rounds() {
        assert_eq!(rr_raw_to_ms(819), 800);
        assert_eq!(rr_raw_to_ms(829), 810);
        assert_eq!(rr_raw_to_ms(809), 790);
        assert_eq!(rr_raw_to_ms(1024), 1000);
        assert_eq!(rr_raw_to_ms(0), 0);
    }

    // ── Unpacked RR delivery ─────────────────────────────────────────────────

    fn packet_with_rr(rr_ms: Vec<u16>) -> HrPacket {
        HrPacket {
            bpm: 75,
            contact: ContactStatus::Contact,
            energy_kj: None,
            rr_ms,
        }
    }

    #[test]
    fn unpack_rr_timestamp_walk() {
        // RR = [800, 810, 790] ms arriving at T must yield frames at
        // T−1600 ms, T−810 ms, and T.
        let t = 10_000_000_000u64;
        let frames = unpack_rr_frames(&packet_with_rr(vec![800, 810, 790]), t, false);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].timestamp_ns, t - 1_600_000_000);
        assert_eq!(frames[1].timestamp_ns, t - 810_000_000);
        assert_eq!(frames[2].timestamp_ns, t);
        assert_eq!(frames[0].rr_ms, vec![800]);
        assert_eq!(frames[1].rr_ms, vec![810]);
        assert_eq!(frames[2].rr_ms, vec![790]);
        // device bpm carried through unchanged
        assert!(frames.iter().all(|f| f.bpm == 75));
    }

    #[test]
    fn unpack_rr_instant_rate() {
        let t = 10_000_000_000u64;
        let frames = unpack_rr_frames(&packet_with_rr(vec![800, 810, 790]), t, true);
        let bpm: Vec<u16> = frames.iter().map(|f| f.bpm).collect();
        assert_eq!(bpm, vec![75, 74, 76]);
    }

    #[test]
    fn unpack_rr_single_and_empty() {
        let t = 5_000_000_000u64;
        let frames = unpack_rr_frames(&packet_with_rr(vec![1000]), t, true);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_ns, t);
        assert_eq!(frames[0].bpm, 60);

        let frames = unpack_rr_frames(&packet_with_rr(vec![]), t, true);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_ns, t);
        assert_eq!(frames[0].bpm, 75); // nothing to derive a rate from
        assert!(frames[0].rr_ms.is_empty());
    }
}
