//! # polar-rs
//!
//! Async decode engine for Polar BLE heart monitors: the standard Heart
//! Rate service plus the vendor Polar Measurement Data (PMD) streaming
//! protocol (ECG, accelerometer, PPG), turned from raw notification
//! bytes into structured, timestamped physiological samples.
//!
//! ## Supported hardware
//!
//! | Device | Heart rate | ECG | ACC | PPG | Notes |
//! |---|---|---|---|---|---|
//! | Polar H10 | ✓ | ✓ | ✓ | ✗ | 130 Hz ECG, delta-compressed ACC |
//! | Polar H9 | ✓ | ✗ | ✗ | ✗ | heart rate + RR only |
//! | Verity Sense | ✓ | ✗ | ✓ | ✓ | SDK mode unlocks wider settings |
//!
//! Connection management is deliberately out of scope: you connect with
//! your BLE stack of choice and hand the engine a
//! [`transport::SensorTransport`]. A ready-made adapter over a connected
//! `btleplug` peripheral is provided ([`transport::BleTransport`]).
//!
//! ## Quick start
//!
//! ```no_run
//! use polar_rs::prelude::*;
//! use tokio::sync::mpsc;
//!
//! # async fn demo(transport: BleTransport) -> Result<(), Error> {
//! let client = PolarClient::attach(transport).await?;
//!
//! // Heart rate, one frame per RR interval:
//! let (tx, mut rx) = mpsc::channel(128);
//! client
//!     .start_heart_rate(
//!         HeartRateOptions { unpack_rr: true, instant_rate: true },
//!         FrameSink::queue(tx),
//!     )
//!     .await?;
//!
//! while let Some(item) = rx.recv().await {
//!     match item {
//!         StreamItem::Frame(f) => println!("{} bpm  rr={:?} ms", f.bpm, f.rr_ms),
//!         StreamItem::EndOfStream => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Streaming ECG looks the same, with a settings negotiation in front:
//! query [`polar_client::PolarClient::available_settings`], pick values,
//! pass them to [`polar_client::PolarClient::start_streaming`], and read
//! [`types::DataFrame`]s until the end-of-stream sentinel.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`polar_client`] | Control channel, notification router, and the public API |
//! | [`types`] | All data entities produced by the engine |
//! | [`protocol`] | GATT UUIDs, PMD wire constants, control-frame codecs |
//! | [`parse`] | Pure byte-to-sample decoders for PMD frames and heart rate |
//! | [`delivery`] | Callback/queue sinks, FIFO delivery, backpressure |
//! | [`session`] | Per-stream lifecycle state machine |
//! | [`transport`] | The transport seam + bundled btleplug adapter |
//! | [`error`] | Error taxonomy |
//!
//! ## Delivery and backpressure
//!
//! Each stream fans out to exactly one sink, chosen at subscribe time:
//! an async callback that is awaited per frame (slow consumers
//! back-pressure decoding directly), or a bounded queue pushed without
//! blocking (size it for your stream's rate — overflow drops frames and
//! logs). See [`delivery`] for the contract and [`delivery::StreamItem`]
//! for the single end-of-stream sentinel every terminated session emits.

pub mod delivery;
pub mod error;
pub mod parse;
pub mod polar_client;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// A single glob import covers the surface needed to attach to a
/// connected sensor, negotiate a stream, and process frames:
///
/// ```no_run
/// use polar_rs::prelude::*;
///
/// # async fn demo(transport: BleTransport) -> Result<(), Error> {
/// let client = PolarClient::attach(transport).await?;
/// let types = client.available_measurements().await?;
/// println!("device streams: {types:?}");
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::polar_client::PolarClient;

    // ── Delivery ──────────────────────────────────────────────────────────────
    pub use crate::delivery::{FrameSink, StreamItem};

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::types::{
        ContactStatus, DataFrame, HeartRateFrame, HeartRateOptions, MeasurementType,
        PmdSetting, PmdStatus, SampleData, SettingsMap, StartAck,
    };

    // ── Transport ─────────────────────────────────────────────────────────────
    pub use crate::transport::{
        BleTransport, CharacteristicRole, SensorTransport, TransportEvent,
    };

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{Error, FrameError};
}
