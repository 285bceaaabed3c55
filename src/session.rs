//! Per-stream session lifecycle.
//!
//! A streaming session is created when a caller subscribes (attaches a
//! sink), walks through at most four states, and is destroyed exactly
//! once:
//!
//! ```text
//! Idle ──(settings query ok)──▶ SettingsNegotiated
//!   │                                  │
//!   └──────────(start ok)──────────────┴──▶ Streaming ──▶ Stopped
//! ```
//!
//! Negotiation is optional — `Idle` may go straight to `Streaming`.
//! `Stopped` is terminal: explicit stop, device disconnect, or a
//! rejected start all land here, and the transition emits the session's
//! single end-of-stream sentinel. Stopping an already-stopped session is
//! a no-op.
//!
//! Sessions own their decoder bookkeeping and their sink exclusively;
//! they are driven only by the router task, so no locking is involved.

use log::{debug, warn};

use crate::delivery::{FrameSink, StreamItem};
use crate::parse::{decode_heart_rate, unpack_rr_frames};
use crate::types::{DataFrame, HeartRateFrame, HeartRateOptions};

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing negotiated or started yet.
    Idle,
    /// A settings query for this measurement type succeeded.
    SettingsNegotiated,
    /// The device acknowledged a start request; frames are flowing.
    Streaming,
    /// Terminal. The end-of-stream sentinel has been emitted.
    Stopped,
}

/// One measurement stream: its state, its sink, and the bookkeeping the
/// decode path needs.
pub(crate) struct StreamingSession {
    state: SessionState,
    sink: Option<FrameSink<DataFrame>>,
    /// Timestamp of the last delivered frame, used to flag ordering
    /// regressions (frame timestamps must be non-decreasing while
    /// streaming).
    last_timestamp_ns: Option<u64>,
}

impl StreamingSession {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Idle,
            sink: None,
            last_timestamp_ns: None,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Record a successful settings negotiation.
    pub(crate) fn note_negotiated(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::SettingsNegotiated;
        }
    }

    /// Install the consumer sink ahead of a start request, so that no
    /// leading frame can be lost between the device's acknowledgement
    /// and the first data notification.
    ///
    /// Returns `false` (leaving the existing sink in place) when a sink
    /// is already installed — the stream is active or mid-start.
    pub(crate) fn attach_sink(&mut self, sink: FrameSink<DataFrame>) -> bool {
        if self.sink.is_some() || self.state == SessionState::Stopped {
            return false;
        }
        self.sink = Some(sink);
        true
    }

    /// The device acknowledged the start request.
    pub(crate) fn confirm_start(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::SettingsNegotiated => {
                self.state = SessionState::Streaming;
            }
            SessionState::Streaming | SessionState::Stopped => {}
        }
    }

    /// Deliver one decoded frame to the sink.
    ///
    /// Frames arriving before the start is confirmed are delivered too:
    /// the acknowledgement and the first data notification can be
    /// observed by different tasks, and the device only streams after
    /// acknowledging.
    pub(crate) async fn deliver(&mut self, frame: DataFrame) {
        if self.state == SessionState::Stopped {
            debug!("dropping frame for stopped {:?} session", frame.measurement);
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            debug!("no sink for {:?} frame", frame.measurement);
            return;
        };
        if let Some(last) = self.last_timestamp_ns {
            if frame.timestamp_ns < last {
                warn!(
                    "{:?} frame timestamp went backwards ({} < {last})",
                    frame.measurement, frame.timestamp_ns
                );
            }
        }
        self.last_timestamp_ns = Some(frame.timestamp_ns);
        sink.deliver(StreamItem::Frame(frame)).await;
    }

    /// Move to `Stopped` and emit the end-of-stream sentinel.
    ///
    /// Idempotent: only the first call emits the sentinel.
    pub(crate) async fn terminate(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = SessionState::Stopped;
        if let Some(sink) = self.sink.as_mut() {
            sink.deliver(StreamItem::EndOfStream).await;
        }
    }
}

/// The heart-rate subscription: delivery options plus the sink.
///
/// Unlike PMD streams there is no negotiation or start handshake — the
/// standard characteristic begins notifying as soon as it is subscribed —
/// so the full state machine is not needed; only terminated-once
/// tracking remains.
pub(crate) struct HeartRateSession {
    options: HeartRateOptions,
    sink: FrameSink<HeartRateFrame>,
    terminated: bool,
}

impl HeartRateSession {
    pub(crate) fn new(options: HeartRateOptions, sink: FrameSink<HeartRateFrame>) -> Self {
        Self {
            options,
            sink,
            terminated: false,
        }
    }

    /// Decode one heart-rate notification and deliver it in the
    /// configured shape (packed, or one frame per RR interval).
    pub(crate) async fn handle_notification(&mut self, payload: &[u8], arrival_ns: u64) {
        if self.terminated {
            return;
        }
        let packet = match decode_heart_rate(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("skipping undecodable heart-rate notification: {e}");
                return;
            }
        };
        if self.options.unpack_rr {
            for frame in unpack_rr_frames(&packet, arrival_ns, self.options.instant_rate) {
                self.sink.deliver(StreamItem::Frame(frame)).await;
            }
        } else {
            self.sink
                .deliver(StreamItem::Frame(packet.into_frame(arrival_ns)))
                .await;
        }
    }

    /// Emit the end-of-stream sentinel; idempotent.
    pub(crate) async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.sink.deliver(StreamItem::EndOfStream).await;
    }
}
