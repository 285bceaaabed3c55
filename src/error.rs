//! Error taxonomy for the decode engine.
//!
//! Four failure classes, kept deliberately distinct:
//!
//! | Variant | Meaning | Recovery |
//! |---|---|---|
//! | [`Error::Protocol`] | malformed or unrecognized device bytes | caller decides; not device-reported |
//! | [`Error::Device`] | the device *rejected* a command | normal outcome, retry with other settings |
//! | [`FrameError`] | one data frame failed to decode | frame skipped, stream stays alive |
//! | [`Error::Disconnected`] | the BLE link dropped | terminates sessions, releases waiters |
//!
//! No command is retried internally; retry policy belongs to the caller,
//! who alone knows whether re-negotiation is meaningful after a rejection.

use thiserror::Error;

use crate::types::{MeasurementType, PmdStatus};

/// Top-level error type returned by [`crate::polar_client::PolarClient`]
/// operations and the [`crate::transport::SensorTransport`] trait.
#[derive(Debug, Error)]
pub enum Error {
    /// Device bytes did not match the expected wire format. This is a
    /// protocol-level fault (ours or the firmware's), not a rejection the
    /// device chose to report.
    #[error("malformed device data: {0}")]
    Protocol(String),

    /// The device answered a control-point command with a non-success
    /// status. Recoverable: the caller may retry with different settings.
    ///
    /// Note that [`crate::polar_client::PolarClient::start_streaming`]
    /// reports rejections through [`crate::types::StartAck`] instead, since
    /// a rejected start is an expected, reportable outcome there.
    #[error("device rejected command: {status}")]
    Device {
        /// The status code and canonical message reported by the device.
        status: PmdStatus,
    },

    /// A single data frame failed to decode. The router never surfaces
    /// this variant to API callers — it skips the frame and logs — but
    /// the conversion exists for callers using [`crate::parse`] directly.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The BLE link is gone. Every open session has been terminated (each
    /// emitting its end-of-stream sentinel) and any pending control-point
    /// wait has been released with this error.
    #[error("device disconnected")]
    Disconnected,

    /// The underlying transport failed to write, read, or subscribe.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The requested delivery configuration is contradictory, e.g.
    /// instant-rate heart rate combined with packed RR delivery.
    #[error("invalid delivery configuration: {0}")]
    Config(&'static str),
}

/// A single streaming or heart-rate frame could not be decoded.
///
/// The decoders in [`crate::parse`] return this; the router reacts by
/// skipping the offending frame and logging a warning, keeping the
/// stream alive (loss of one frame is preferable to tearing down a
/// whole measurement session).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The notification is shorter than the fixed frame header.
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    /// Byte 0 carries a measurement-type tag this crate does not know.
    #[error("unknown measurement type tag 0x{0:02x}")]
    UnknownType(u8),

    /// The frame-type selector byte does not name a layout defined for
    /// this measurement type.
    #[error("unknown frame type 0x{frame_type:02x} for {measurement:?}")]
    UnknownFrameType {
        measurement: MeasurementType,
        frame_type: u8,
    },

    /// The payload length is not divisible by the declared per-sample
    /// stride (channel count × sample width).
    #[error("payload of {len} bytes is not divisible by the {stride}-byte sample stride")]
    RaggedPayload { len: usize, stride: usize },

    /// A delta block header or its packed bits run past the end of the
    /// payload.
    #[error("delta block truncated at payload offset {0}")]
    TruncatedDelta(usize),

    /// A delta block declared a bit width of zero or more than 32 bits.
    #[error("delta width of {0} bits is out of range")]
    BadDeltaWidth(u8),
}
