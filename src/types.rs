use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A measurement stream type offered by the Polar Measurement Data (PMD)
/// service.
///
/// The tag values are the wire bytes used both in control-point commands
/// and as byte 0 of every streaming data frame.
///
/// | Variant | Tag | Frame decoding |
/// |---|---|---|
/// | `Ecg` | 0x00 | ✓ (µV samples) |
/// | `Ppg` | 0x01 | ✓ (4-channel raw ADC) |
/// | `Acc` | 0x02 | ✓ (mG triplets) |
/// | `Ppi` | 0x03 | enumeration/control only |
/// | `Gyro` | 0x05 | enumeration/control only |
/// | `Mag` | 0x06 | enumeration/control only |
/// | `SdkMode` | 0x09 | control only (start/stop unlock wider settings) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementType {
    /// Electrocardiogram, one channel, samples in microvolt.
    Ecg,
    /// Photoplethysmogram, three optical channels plus ambient.
    Ppg,
    /// Accelerometer, XYZ triplets in milli-G.
    Acc,
    /// Beat-to-beat peak-to-peak intervals (control/enumeration only).
    Ppi,
    /// Gyroscope (control/enumeration only).
    Gyro,
    /// Magnetometer (control/enumeration only).
    Mag,
    /// Not a sensor: starting this "measurement" switches the device into
    /// SDK mode, unlocking wider sample-rate/resolution choices on Verity
    /// Sense sensors. Stop it to return to the default mode.
    SdkMode,
}

impl MeasurementType {
    /// The wire tag used in control requests and data-frame headers.
    pub fn tag(self) -> u8 {
        match self {
            MeasurementType::Ecg => 0x00,
            MeasurementType::Ppg => 0x01,
            MeasurementType::Acc => 0x02,
            MeasurementType::Ppi => 0x03,
            MeasurementType::Gyro => 0x05,
            MeasurementType::Mag => 0x06,
            MeasurementType::SdkMode => 0x09,
        }
    }

    /// Inverse of [`MeasurementType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(MeasurementType::Ecg),
            0x01 => Some(MeasurementType::Ppg),
            0x02 => Some(MeasurementType::Acc),
            0x03 => Some(MeasurementType::Ppi),
            0x05 => Some(MeasurementType::Gyro),
            0x06 => Some(MeasurementType::Mag),
            0x09 => Some(MeasurementType::SdkMode),
            _ => None,
        }
    }
}

/// A negotiable stream parameter understood by the PMD control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PmdSetting {
    /// Samples per second (e.g. 130 for H10 ECG, 176 for Verity PPG).
    SampleRate,
    /// ADC resolution in bits (e.g. 14, 16, 22).
    Resolution,
    /// Full-scale range (accelerometer, in G).
    Range,
    /// Number of channels (PPG).
    Channels,
}

impl PmdSetting {
    /// The wire id used in `(id, count, values…)` parameter blocks.
    pub fn id(self) -> u8 {
        match self {
            PmdSetting::SampleRate => 0x00,
            PmdSetting::Resolution => 0x01,
            PmdSetting::Range => 0x02,
            PmdSetting::Channels => 0x04,
        }
    }

    /// Inverse of [`PmdSetting::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x00 => Some(PmdSetting::SampleRate),
            0x01 => Some(PmdSetting::Resolution),
            0x02 => Some(PmdSetting::Range),
            0x04 => Some(PmdSetting::Channels),
            _ => None,
        }
    }
}

/// The discrete legal values a device advertises for each setting of one
/// measurement type, as returned by
/// [`crate::polar_client::PolarClient::available_settings`].
///
/// Values are u16s in the unit implied by the setting (Hz, bits, G,
/// channel count). Pick one value per setting and pass the chosen pairs
/// to `start_streaming`.
pub type SettingsMap = BTreeMap<PmdSetting, BTreeSet<u16>>;

// ── Control-point results ─────────────────────────────────────────────────────

/// A status code reported by the PMD control point.
///
/// Zero is success; every non-zero code is a *device decision*, not a
/// protocol fault — asking for an unsupported sample rate yields
/// `invalid parameter`, starting a stream twice yields `already in state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmdStatus(pub u8);

impl PmdStatus {
    pub const SUCCESS: PmdStatus = PmdStatus(0);
    pub const ALREADY_IN_STATE: PmdStatus = PmdStatus(6);
    pub const INVALID_STATE: PmdStatus = PmdStatus(12);

    /// The raw status byte.
    pub fn code(self) -> u8 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Canonical human-readable message for this code.
    pub fn message(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "invalid op code",
            2 => "invalid measurement type",
            3 => "not supported",
            4 => "invalid length",
            5 => "invalid parameter",
            6 => "already in state",
            7 => "invalid resolution",
            8 => "invalid sample rate",
            9 => "invalid range",
            10 => "invalid MTU",
            11 => "invalid number of channels",
            12 => "invalid state",
            13 => "device in charger",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for PmdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message(), self.0)
    }
}

/// A decoded control-point response notification.
///
/// The control point gives no request identifier: a response is matched
/// to a request purely by position (next notification after the write),
/// which is why the command channel serializes requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Echo of the request opcode.
    pub opcode: u8,
    /// Echo of the measurement type the request named.
    pub measurement: MeasurementType,
    /// Device verdict on the request.
    pub status: PmdStatus,
    /// Continuation flag: the device will send further notifications
    /// extending `payload`. Parsed but not reassembled — settings
    /// payloads fit a single notification in practice.
    pub more: bool,
    /// Opcode-specific payload (settings blocks for a settings query,
    /// acknowledgement bytes for a start).
    pub payload: Vec<u8>,
}

/// Outcome of a start-streaming request.
///
/// A non-zero status here is a *normal, reportable* result — invalid
/// settings, already streaming, sensor in the charger — not a fault, so
/// `start_streaming` returns it as `Ok(StartAck)` rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAck {
    /// Device verdict; check [`PmdStatus::is_success`].
    pub status: PmdStatus,
    /// Canonical message for `status`.
    pub message: &'static str,
    /// Acknowledgement payload (device-specific, often echoes the
    /// accepted stream parameters).
    pub payload: Vec<u8>,
}

// ── Streaming data frames ─────────────────────────────────────────────────────

/// Decoded sample payload of one PMD data frame, tagged by measurement
/// type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleData {
    /// ECG voltage samples in microvolt, oldest first.
    Ecg(Vec<i32>),
    /// Accelerometer `[x, y, z]` triplets in milli-G, oldest first.
    Acc(Vec<[i32; 3]>),
    /// PPG `[ppg0, ppg1, ppg2, ambient]` tuples of raw ADC counts,
    /// oldest first.
    Ppg(Vec<[i32; 4]>),
}

impl SampleData {
    /// Number of (multi-channel) samples in this frame. May be zero —
    /// keepalive frames carry no samples.
    pub fn len(&self) -> usize {
        match self {
            SampleData::Ecg(v) => v.len(),
            SampleData::Acc(v) => v.len(),
            SampleData::Ppg(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded PMD streaming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Which stream this frame belongs to.
    pub measurement: MeasurementType,
    /// Device timestamp in nanoseconds. Refers to the **last** sample in
    /// the frame; earlier samples are spaced backwards at the negotiated
    /// sample rate.
    pub timestamp_ns: u64,
    /// The decoded samples with per-type unit scaling applied.
    pub samples: SampleData,
}

impl DataFrame {
    /// Convenience for [`SampleData::len`].
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

// ── Heart rate ────────────────────────────────────────────────────────────────

/// Skin-contact detection reported in the heart-rate flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    /// The sensor does not report contact status.
    Unsupported,
    /// Contact detection supported, but the strap/sensor is not touching
    /// skin.
    NoContact,
    /// Skin contact detected.
    Contact,
}

/// The fields decoded from one standard heart-rate measurement
/// notification, before delivery shaping (packed vs unpacked).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrPacket {
    /// Heart rate in beats per minute as reported by the device.
    pub bpm: u16,
    /// Skin-contact status from the flags byte.
    pub contact: ContactStatus,
    /// Accumulated energy expenditure in kilojoule, when the device
    /// includes the field.
    pub energy_kj: Option<u16>,
    /// RR intervals in milliseconds, oldest first. Often empty — the
    /// field is optional and the count is derived from the notification
    /// length.
    pub rr_ms: Vec<u16>,
}

impl HrPacket {
    /// Package this packet as a single delivered frame carrying the full
    /// RR sequence (packed delivery).
    pub fn into_frame(self, timestamp_ns: u64) -> HeartRateFrame {
        HeartRateFrame {
            timestamp_ns,
            bpm: self.bpm,
            contact: self.contact,
            rr_ms: self.rr_ms,
            energy_kj: self.energy_kj,
        }
    }
}

/// A delivered heart-rate frame.
///
/// In packed delivery there is one frame per notification, carrying the
/// whole RR sequence. In unpacked delivery there is one frame per RR
/// interval, each carrying a single RR value and a synthesized timestamp
/// (see [`crate::parse::unpack_rr_frames`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartRateFrame {
    /// Nanoseconds since the Unix epoch. Notification arrival time for
    /// packed delivery; synthesized per interval for unpacked delivery.
    pub timestamp_ns: u64,
    /// Beats per minute. With the instant-rate option this is
    /// `round(60000 / rr_ms)` for the frame's single interval instead of
    /// the device-reported average.
    pub bpm: u16,
    /// Skin-contact status.
    pub contact: ContactStatus,
    /// RR intervals in milliseconds (a single element in unpacked
    /// delivery, possibly empty in packed delivery).
    pub rr_ms: Vec<u16>,
    /// Energy expenditure in kilojoule, when present.
    pub energy_kj: Option<u16>,
}

/// Delivery options for a heart-rate subscription.
///
/// | `unpack_rr` | `instant_rate` | Behavior |
/// |---|---|---|
/// | `false` | `false` | one frame per notification, full RR sequence |
/// | `true` | `false` | one frame per RR interval, device bpm |
/// | `true` | `true` | one frame per RR interval, bpm from that interval |
/// | `false` | `true` | rejected — instant rate needs per-interval frames |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartRateOptions {
    /// Deliver one frame per RR interval instead of one per notification.
    pub unpack_rr: bool,
    /// Replace the device-reported bpm with `round(60000 / rr_ms)` per
    /// interval. Only valid together with `unpack_rr`.
    pub instant_rate: bool,
}
