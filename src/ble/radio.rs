//! Radio abstraction consumed by sessions and the orchestrator.
//!
//! The [`Radio`] trait locates peripherals, establishes links and reports
//! advertisement sightings. A [`Link`] is one established connection.
//! Everything the radio observes asynchronously (notifications, link loss)
//! is pushed through a [`LinkEventSink`] into a channel drained by the
//! control context, never applied from the radio's own tasks.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::session::CallbackHandle;

/// A located, connectable peripheral.
///
/// Handles are replaced whenever a fresher sighting arrives, since the same
/// address can be rediscovered through another adapter.
pub trait PeripheralHandle: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Bluetooth address (or platform identifier) of the peripheral.
    fn address(&self) -> &str;
}

/// What happened on a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    /// Notification data from a subscribed characteristic.
    Notification {
        /// UUID of the characteristic that sent the notification.
        characteristic: Uuid,
        /// The notification data.
        data: Bytes,
    },
    /// The link dropped.
    Disconnected,
}

/// Event raised by a link, tagged with the connection attempt it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Connection attempt that produced the link.
    pub generation: u64,
    /// The event itself.
    pub kind: LinkEventKind,
}

/// Sending half handed to the radio when connecting.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    /// Create a sink for one connection attempt.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    /// Get the connection attempt this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward a notification. Returns `false` once nobody is listening.
    pub fn notification(&self, characteristic: Uuid, data: impl Into<Bytes>) -> bool {
        self.send(LinkEventKind::Notification {
            characteristic,
            data: data.into(),
        })
    }

    /// Report that the link dropped. Returns `false` once nobody is listening.
    pub fn disconnected(&self) -> bool {
        self.send(LinkEventKind::Disconnected)
    }

    /// Check if the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, kind: LinkEventKind) -> bool {
        self.tx
            .send(LinkEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// An established connection to a peripheral.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// Enable notifications from a characteristic.
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Disable notifications from a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write to a characteristic, optionally waiting for the acknowledgement.
    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;
}

/// The radio subsystem.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Handle for a located peripheral.
    type Peripheral: PeripheralHandle;
    /// Established link type.
    type Link: Link + 'static;

    /// Locate a peripheral by address. Returns `None` if it is not visible.
    async fn find_peripheral(&self, address: &str) -> Option<Self::Peripheral>;

    /// Connect, retrying transient handshake failures internally.
    ///
    /// Notifications and link loss are reported through `events` for as long
    /// as the link lives.
    async fn connect_with_retry(
        &self,
        peripheral: &Self::Peripheral,
        events: LinkEventSink,
    ) -> Result<Self::Link>;

    /// Report every advertisement from `address` on `sightings` until the
    /// returned handle is dropped or unregistered.
    async fn watch_advertisements(
        &self,
        address: &str,
        sightings: mpsc::UnboundedSender<Self::Peripheral>,
    ) -> Result<CallbackHandle>;
}
