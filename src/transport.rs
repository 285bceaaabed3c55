//! The transport seam: what the decode engine consumes from an
//! already-connected BLE stack.
//!
//! Discovery, connection establishment, pairing, and GATT service
//! discovery are the caller's business (run them with `btleplug` or any
//! other stack). The engine only needs the four primitives of
//! [`SensorTransport`]: write, read, (un)subscribe — all addressed by
//! [`CharacteristicRole`] rather than raw UUIDs — plus one serialized
//! stream of [`TransportEvent`]s carrying notifications and the
//! disconnect signal.
//!
//! [`BleTransport`] is the bundled implementation over a connected
//! `btleplug` [`Peripheral`]; tests inject channel-backed mocks instead.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::{BATTERY_LEVEL, HEART_RATE_MEASUREMENT, PMD_CONTROL, PMD_DATA};

/// The characteristics the engine talks to, by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Standard heart-rate measurement characteristic (notify).
    HeartRate,
    /// PMD control point (write + notify + read for the feature mask).
    PmdControl,
    /// PMD data characteristic (notify).
    PmdData,
    /// Standard battery-level characteristic (read).
    Battery,
}

impl CharacteristicRole {
    /// The GATT UUID this role maps to.
    pub fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::HeartRate => HEART_RATE_MEASUREMENT,
            CharacteristicRole::PmdControl => PMD_CONTROL,
            CharacteristicRole::PmdData => PMD_DATA,
            CharacteristicRole::Battery => BATTERY_LEVEL,
        }
    }

    /// Inverse of [`CharacteristicRole::uuid`].
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        [
            CharacteristicRole::HeartRate,
            CharacteristicRole::PmdControl,
            CharacteristicRole::PmdData,
            CharacteristicRole::Battery,
        ]
        .into_iter()
        .find(|role| role.uuid() == uuid)
    }
}

/// One event from the transport, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A notification arrived on a subscribed characteristic.
    Notification {
        role: CharacteristicRole,
        payload: Vec<u8>,
    },
    /// The link dropped. Terminal: the engine stops consuming after the
    /// first one.
    Disconnected,
}

/// The serialized event stream consumed by the engine's router task.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// The write/read/subscribe surface of an already-connected sensor.
///
/// Implementations must deliver notifications for any one characteristic
/// in arrival order; the engine relies on that ordering to correlate
/// control-point responses positionally.
#[async_trait]
pub trait SensorTransport: Send + Sync + 'static {
    /// Write `payload` to the characteristic for `role`, returning once
    /// the write completes.
    async fn write(&self, role: CharacteristicRole, payload: &[u8]) -> Result<(), Error>;

    /// Read the current value of the characteristic for `role`.
    async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>, Error>;

    /// Enable notifications for `role`.
    async fn subscribe(&self, role: CharacteristicRole) -> Result<(), Error>;

    /// Disable notifications for `role`.
    async fn unsubscribe(&self, role: CharacteristicRole) -> Result<(), Error>;

    /// The event stream. Called once, when the engine attaches.
    async fn events(&self) -> Result<EventStream, Error>;
}

// ── btleplug implementation ───────────────────────────────────────────────────

impl From<btleplug::Error> for Error {
    fn from(e: btleplug::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// [`SensorTransport`] over a connected `btleplug` peripheral.
///
/// The peripheral must already be connected with services discovered;
/// roles whose characteristic the device does not expose (e.g. the PMD
/// service on a plain heart-rate strap) fail at the point of use, not at
/// construction.
pub struct BleTransport {
    peripheral: Peripheral,
    adapter: Adapter,
    chars: HashMap<CharacteristicRole, Characteristic>,
}

impl BleTransport {
    /// Wrap a connected peripheral. `adapter` is the adapter that made
    /// the connection; its event stream is watched for the disconnect
    /// signal.
    pub fn new(peripheral: Peripheral, adapter: Adapter) -> Self {
        let mut chars = HashMap::new();
        for c in peripheral.characteristics() {
            if let Some(role) = CharacteristicRole::from_uuid(c.uuid) {
                chars.insert(role, c);
            }
        }
        info!(
            "transport ready: {} of 4 roles present",
            chars.len()
        );
        Self {
            peripheral,
            adapter,
            chars,
        }
    }

    fn char_for(&self, role: CharacteristicRole) -> Result<&Characteristic, Error> {
        self.chars.get(&role).ok_or_else(|| {
            Error::Transport(format!("device does not expose the {role:?} characteristic"))
        })
    }
}

#[async_trait]
impl SensorTransport for BleTransport {
    async fn write(&self, role: CharacteristicRole, payload: &[u8]) -> Result<(), Error> {
        let c = self.char_for(role)?;
        self.peripheral
            .write(c, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, role: CharacteristicRole) -> Result<Vec<u8>, Error> {
        let c = self.char_for(role)?;
        Ok(self.peripheral.read(c).await?)
    }

    async fn subscribe(&self, role: CharacteristicRole) -> Result<(), Error> {
        let c = self.char_for(role)?;
        Ok(self.peripheral.subscribe(c).await?)
    }

    async fn unsubscribe(&self, role: CharacteristicRole) -> Result<(), Error> {
        let c = self.char_for(role)?;
        Ok(self.peripheral.unsubscribe(c).await?)
    }

    /// Merge the peripheral's notification stream with the adapter's
    /// disconnect events into one ordered stream.
    ///
    /// The adapter watcher fires reliably when the link drops (sensor
    /// powered off, strap out of range) — often sooner than the
    /// notification stream closing, which is also mapped to
    /// [`TransportEvent::Disconnected`] as a fallback.
    async fn events(&self) -> Result<EventStream, Error> {
        let (tx, rx) = mpsc::channel::<TransportEvent>(64);

        let mut notifications = self.peripheral.notifications().await?;
        let notif_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                let Some(role) = CharacteristicRole::from_uuid(n.uuid) else {
                    debug!("notification from unmapped characteristic {}", n.uuid);
                    continue;
                };
                if notif_tx
                    .send(TransportEvent::Notification {
                        role,
                        payload: n.value,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            info!("notification stream ended — reporting disconnect");
            let _ = notif_tx.send(TransportEvent::Disconnected).await;
        });

        let mut central_events = self.adapter.events().await?;
        let peripheral_id = self.peripheral.id();
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("device {id:?} disconnected");
                        let _ = tx.send(TransportEvent::Disconnected).await;
                        return;
                    }
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|ev| (ev, rx))
        })
        .boxed())
    }
}
