//! The client: control-point command channel, notification router, and
//! the public streaming API.
//!
//! One spawned router task consumes the transport's serialized event
//! stream and owns every session exclusively — frame ordering falls out
//! of that single consumer, with no locking on the data path. The only
//! cross-task shared mutable state is the control channel's single
//! response slot.
//!
//! # Control-point correlation
//!
//! The PMD control point carries no request identifier: the response to
//! a command is simply the *next* notification on that characteristic.
//! Correlation is therefore positional, and the command channel is an
//! explicit one-slot exchange: a fair async mutex queues callers FIFO,
//! the holder arms the slot, writes its request, and suspends until the
//! router fulfils the slot or the link drops. A second request issued
//! while one is outstanding waits its turn; it can never be handed the
//! first request's response.
//!
//! # Disconnect semantics
//!
//! Disconnect is the sole cancellation signal. It releases any pending
//! control-point wait with [`Error::Disconnected`] and terminates every
//! session (each sink receives its end-of-stream sentinel). When a
//! response and a disconnect are observed near-simultaneously the
//! disconnect wins, deterministically: the waiter polls the link watch
//! before the response slot. There are no operation timeouts — an
//! unresponsive but still-connected device hangs a control wait
//! indefinitely, by design.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OnceCell};

use crate::delivery::FrameSink;
use crate::error::Error;
use crate::parse::decode_pmd_frame;
use crate::protocol::{
    decode_control_response, encode_settings_request, encode_start_request, encode_stop_request,
    parse_feature_bitmask, parse_settings_payload,
};
use crate::session::{HeartRateSession, StreamingSession};
use crate::transport::{CharacteristicRole, EventStream, SensorTransport, TransportEvent};
use crate::types::{
    ControlResponse, DataFrame, HeartRateFrame, HeartRateOptions, MeasurementType, PmdSetting,
    PmdStatus, SettingsMap, StartAck,
};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before Unix epoch")
        .as_nanos() as u64
}

// ── Control-point response slot ───────────────────────────────────────────────

/// The single-slot handoff between the router (producer) and the one
/// caller whose control request is outstanding.
#[derive(Default)]
struct ResponseSlot(std::sync::Mutex<Option<oneshot::Sender<Vec<u8>>>>);

impl ResponseSlot {
    /// Arm the slot for the next control-point notification. The command
    /// gate guarantees at most one armed waiter at a time.
    fn arm(&self) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .0
            .lock()
            .expect("control slot lock poisoned")
            .replace(tx);
        debug_assert!(previous.is_none(), "control request already outstanding");
        rx
    }

    fn clear(&self) {
        self.0.lock().expect("control slot lock poisoned").take();
    }

    /// Hand a control-point notification to the armed waiter, if any.
    fn fulfil(&self, payload: Vec<u8>) -> bool {
        match self.0.lock().expect("control slot lock poisoned").take() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

enum RouterCommand {
    /// A settings query for this type succeeded.
    NoteNegotiated(MeasurementType),
    /// Install a sink ahead of a start request. Replies `false` if the
    /// stream already has one.
    AttachSink {
        measurement: MeasurementType,
        sink: FrameSink<DataFrame>,
        replied: oneshot::Sender<bool>,
    },
    /// The device acknowledged the start.
    ConfirmStart(MeasurementType),
    /// Terminate and remove the session (sentinel emitted if it existed).
    Detach {
        measurement: MeasurementType,
        replied: oneshot::Sender<()>,
    },
    AttachHeartRate {
        session: HeartRateSession,
        replied: oneshot::Sender<()>,
    },
    DetachHeartRate {
        replied: oneshot::Sender<()>,
    },
}

struct Router {
    sessions: HashMap<MeasurementType, StreamingSession>,
    heart_rate: Option<HeartRateSession>,
    slot: Arc<ResponseSlot>,
    link: watch::Sender<bool>,
}

impl Router {
    async fn run(
        mut self,
        mut events: EventStream,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Client handle dropped: tear down all sessions.
                    None => break,
                },
                event = events.next() => match event {
                    Some(TransportEvent::Notification { role, payload }) => {
                        self.route_notification(role, payload).await;
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!("transport disconnected — terminating all sessions");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::NoteNegotiated(measurement) => {
                self.sessions
                    .entry(measurement)
                    .or_insert_with(StreamingSession::new)
                    .note_negotiated();
            }
            RouterCommand::AttachSink {
                measurement,
                sink,
                replied,
            } => {
                let attached = self
                    .sessions
                    .entry(measurement)
                    .or_insert_with(StreamingSession::new)
                    .attach_sink(sink);
                let _ = replied.send(attached);
            }
            RouterCommand::ConfirmStart(measurement) => {
                if let Some(session) = self.sessions.get_mut(&measurement) {
                    session.confirm_start();
                }
            }
            RouterCommand::Detach {
                measurement,
                replied,
            } => {
                if let Some(mut session) = self.sessions.remove(&measurement) {
                    session.terminate().await;
                }
                let _ = replied.send(());
            }
            RouterCommand::AttachHeartRate { session, replied } => {
                if let Some(mut old) = self.heart_rate.replace(session) {
                    old.terminate().await;
                }
                let _ = replied.send(());
            }
            RouterCommand::DetachHeartRate { replied } => {
                if let Some(mut session) = self.heart_rate.take() {
                    session.terminate().await;
                }
                let _ = replied.send(());
            }
        }
    }

    async fn route_notification(&mut self, role: CharacteristicRole, payload: Vec<u8>) {
        match role {
            CharacteristicRole::PmdControl => {
                if !self.slot.fulfil(payload) {
                    debug!("unsolicited control-point notification dropped");
                }
            }
            CharacteristicRole::PmdData => match decode_pmd_frame(&payload) {
                Ok(frame) => match self.sessions.get_mut(&frame.measurement) {
                    Some(session) => session.deliver(frame).await,
                    None => debug!("frame for inactive {:?} stream", frame.measurement),
                },
                // One bad frame is skipped; the stream stays alive.
                Err(e) => warn!("skipping undecodable data frame: {e}"),
            },
            CharacteristicRole::HeartRate => {
                if let Some(session) = self.heart_rate.as_mut() {
                    session.handle_notification(&payload, now_ns()).await;
                } else {
                    debug!("heart-rate notification without a subscription");
                }
            }
            CharacteristicRole::Battery => {
                debug!("unexpected battery notification ignored");
            }
        }
    }

    /// Flip the link watch (releasing any control waiter), clear the
    /// slot, and terminate every session with its sentinel.
    async fn shutdown(&mut self) {
        self.link.send_replace(true);
        self.slot.clear();
        for (_, session) in self.sessions.iter_mut() {
            session.terminate().await;
        }
        if let Some(session) = self.heart_rate.as_mut() {
            session.terminate().await;
        }
    }
}

// ── PolarClient ───────────────────────────────────────────────────────────────

/// Decode-and-control engine for one connected Polar device.
///
/// Construct with [`PolarClient::attach`] over any
/// [`SensorTransport`]. All operations share one control channel and one
/// router task; dropping the client terminates its sessions.
///
/// ```no_run
/// use polar_rs::prelude::*;
/// use tokio::sync::mpsc;
///
/// # async fn demo(transport: BleTransport) -> Result<(), Error> {
/// let client = PolarClient::attach(transport).await?;
/// println!("battery: {}%", client.battery_level().await?);
///
/// let (tx, mut rx) = mpsc::channel(128);
/// let ack = client
///     .start_streaming(MeasurementType::Ecg, &[], FrameSink::queue(tx))
///     .await?;
/// assert!(ack.status.is_success(), "{}", ack.message);
///
/// while let Some(item) = rx.recv().await {
///     match item {
///         StreamItem::Frame(frame) => println!("{} samples", frame.sample_count()),
///         StreamItem::EndOfStream => break,
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct PolarClient<T: SensorTransport> {
    transport: Arc<T>,
    commands: mpsc::UnboundedSender<RouterCommand>,
    gate: Mutex<()>,
    slot: Arc<ResponseSlot>,
    link: watch::Receiver<bool>,
    pmd_ready: OnceCell<()>,
}

impl<T: SensorTransport> PolarClient<T> {
    /// Attach the engine to an already-connected transport and spawn the
    /// notification router.
    pub async fn attach(transport: T) -> Result<Self, Error> {
        let transport = Arc::new(transport);
        let events = transport.events().await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = watch::channel(false);
        let slot = Arc::new(ResponseSlot::default());

        let router = Router {
            sessions: HashMap::new(),
            heart_rate: None,
            slot: Arc::clone(&slot),
            link: link_tx,
        };
        tokio::spawn(router.run(events, cmd_rx));

        Ok(Self {
            transport,
            commands: cmd_tx,
            gate: Mutex::new(()),
            slot,
            link: link_rx,
            pmd_ready: OnceCell::new(),
        })
    }

    /// Whether the transport has reported a disconnect.
    pub fn is_disconnected(&self) -> bool {
        *self.link.borrow()
    }

    // ── Battery ──────────────────────────────────────────────────────────────

    /// Read the battery level, in percent.
    pub async fn battery_level(&self) -> Result<u8, Error> {
        let data = self.transport.read(CharacteristicRole::Battery).await?;
        data.first()
            .copied()
            .ok_or_else(|| Error::Protocol("empty battery-level read".into()))
    }

    // ── Heart rate ───────────────────────────────────────────────────────────

    /// Subscribe to heart-rate notifications with the chosen delivery
    /// mode and sink.
    ///
    /// Fails with [`Error::Config`] if `instant_rate` is requested with
    /// packed delivery — an instant rate only exists per RR interval.
    pub async fn start_heart_rate(
        &self,
        options: HeartRateOptions,
        sink: FrameSink<HeartRateFrame>,
    ) -> Result<(), Error> {
        if options.instant_rate && !options.unpack_rr {
            return Err(Error::Config("instant_rate requires unpack_rr delivery"));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::AttachHeartRate {
                session: HeartRateSession::new(options, sink),
                replied: tx,
            })
            .map_err(|_| Error::Disconnected)?;
        rx.await.map_err(|_| Error::Disconnected)?;
        self.transport.subscribe(CharacteristicRole::HeartRate).await
    }

    /// Stop heart-rate delivery. The sink receives its end-of-stream
    /// sentinel before this returns.
    pub async fn stop_heart_rate(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::DetachHeartRate { replied: tx })
            .is_ok()
        {
            let _ = rx.await;
        }
        self.transport
            .unsubscribe(CharacteristicRole::HeartRate)
            .await
    }

    // ── PMD queries ──────────────────────────────────────────────────────────

    /// The measurement types this device can stream, from the control
    /// point's feature bitmask.
    pub async fn available_measurements(&self) -> Result<BTreeSet<MeasurementType>, Error> {
        let data = self.transport.read(CharacteristicRole::PmdControl).await?;
        parse_feature_bitmask(&data)
    }

    /// The legal settings for `measurement`, as advertised by the
    /// device.
    ///
    /// A device rejection (e.g. querying a type the device cannot
    /// stream) surfaces as [`Error::Device`].
    pub async fn available_settings(
        &self,
        measurement: MeasurementType,
    ) -> Result<SettingsMap, Error> {
        let response = self
            .control_request(encode_settings_request(measurement))
            .await?;
        if !response.status.is_success() {
            return Err(Error::Device {
                status: response.status,
            });
        }
        let map = parse_settings_payload(&response.payload)?;
        let _ = self
            .commands
            .send(RouterCommand::NoteNegotiated(measurement));
        Ok(map)
    }

    // ── PMD streaming ────────────────────────────────────────────────────────

    /// Start streaming `measurement` with the chosen setting values,
    /// delivering frames to `sink`.
    ///
    /// The sink is installed before the command is written, so the first
    /// data frame cannot be lost. A non-success status in the returned
    /// [`StartAck`] is a normal outcome (invalid settings, already
    /// streaming, device in the charger…): the request itself completed,
    /// the device said no. In that case the sink is released again and
    /// receives its end-of-stream sentinel. If this stream is already
    /// active, the supplied sink is discarded and the device's
    /// already-in-state answer is returned.
    pub async fn start_streaming(
        &self,
        measurement: MeasurementType,
        settings: &[(PmdSetting, u16)],
        sink: FrameSink<DataFrame>,
    ) -> Result<StartAck, Error> {
        self.ensure_pmd_ready().await?;

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::AttachSink {
                measurement,
                sink,
                replied: tx,
            })
            .map_err(|_| Error::Disconnected)?;
        let attached = rx.await.map_err(|_| Error::Disconnected)?;
        if !attached {
            debug!("{measurement:?} already has a sink; new sink discarded");
        }

        let response = match self
            .control_request(encode_start_request(measurement, settings))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // On disconnect the router has already torn the session
                // down; otherwise release the sink we just attached.
                if attached && !matches!(e, Error::Disconnected) {
                    self.detach(measurement).await;
                }
                return Err(e);
            }
        };

        if response.status.is_success() {
            let _ = self.commands.send(RouterCommand::ConfirmStart(measurement));
        } else if attached {
            self.detach(measurement).await;
        }

        Ok(StartAck {
            status: response.status,
            message: response.status.message(),
            payload: response.payload,
        })
    }

    /// Stop streaming `measurement`.
    ///
    /// Idempotent: stopping a stream that is not running still returns
    /// success (the device's already-in-state / invalid-state answers
    /// are treated as such), and the end-of-stream sentinel is emitted
    /// at most once, when a live session is actually terminated.
    pub async fn stop_streaming(&self, measurement: MeasurementType) -> Result<(), Error> {
        self.ensure_pmd_ready().await?;
        let response = self
            .control_request(encode_stop_request(measurement))
            .await?;
        let stopped = response.status.is_success()
            || response.status == PmdStatus::ALREADY_IN_STATE
            || response.status == PmdStatus::INVALID_STATE;
        if !stopped {
            return Err(Error::Device {
                status: response.status,
            });
        }
        self.detach(measurement).await;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Subscribe the PMD control and data characteristics once, before
    /// the first command.
    async fn ensure_pmd_ready(&self) -> Result<(), Error> {
        self.pmd_ready
            .get_or_try_init(|| async {
                self.transport
                    .subscribe(CharacteristicRole::PmdControl)
                    .await?;
                self.transport.subscribe(CharacteristicRole::PmdData).await?;
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// One serialized control-point round trip: take the FIFO gate, arm
    /// the response slot, write, and wait for the next control
    /// notification or a disconnect — whichever the biased select sees
    /// first, with the disconnect polled first so it always wins a tie.
    async fn control_request(&self, request: Vec<u8>) -> Result<ControlResponse, Error> {
        let _turn = self.gate.lock().await;
        if *self.link.borrow() {
            return Err(Error::Disconnected);
        }
        let response = self.slot.arm();
        if let Err(e) = self
            .transport
            .write(CharacteristicRole::PmdControl, &request)
            .await
        {
            self.slot.clear();
            return Err(e);
        }
        let mut link = self.link.clone();
        tokio::select! {
            biased;
            _ = link.wait_for(|disconnected| *disconnected) => {
                self.slot.clear();
                Err(Error::Disconnected)
            }
            outcome = response => match outcome {
                Ok(payload) => decode_control_response(&payload),
                Err(_) => Err(Error::Disconnected),
            }
        }
    }

    /// Ask the router to terminate and remove a session, waiting until
    /// the sentinel (if any) has been delivered.
    async fn detach(&self, measurement: MeasurementType) {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Detach {
                measurement,
                replied: tx,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}
