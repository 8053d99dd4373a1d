//! The sensor link as seen by the gateway.
//!
//! The radio stack itself lives outside this crate. A backend implements
//! [`Transport`] and [`Connection`]; the session controller only talks to
//! these traits.

use crate::device::types::{Command, DeviceAddress, DeviceId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

/// Errors reported by a transport backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No device answered at this address.
    NotFound(DeviceAddress),
    /// The link failed while performing an operation.
    Link(String),
    /// The connection was already closed.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotFound(addr) => write!(f, "device not found at {addr}"),
            TransportError::Link(e) => write!(f, "link error: {e}"),
            TransportError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Where a connection delivers raw notification records.
///
/// Each subscribed device gets its own sink; the receiving end is drained by
/// that device's task in the session controller.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    device: DeviceId,
    tx: mpsc::Sender<Vec<u8>>,
}

impl NotificationSink {
    pub fn new(device: DeviceId, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { device, tx }
    }

    /// Deliver without waiting. A full queue drops the record.
    pub fn try_deliver(&self, record: Vec<u8>) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(device = %self.device, "notification queue full, record dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Reports an unexpected link loss for one device.
///
/// Backends call [`DisconnectNotifier::notify`] when the link drops on its
/// own. An explicit [`Connection::disconnect`] must not trigger it.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    device: DeviceId,
    tx: mpsc::UnboundedSender<DeviceId>,
}

impl DisconnectNotifier {
    pub fn new(device: DeviceId, tx: mpsc::UnboundedSender<DeviceId>) -> Self {
        Self { device, tx }
    }

    /// A notifier whose events go nowhere, for links nobody supervises.
    pub fn detached(device: DeviceId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { device, tx }
    }

    pub fn notify(&self) {
        let _ = self.tx.send(self.device.clone());
    }
}

/// Connect and discovery primitives of the sensor link.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a link to the device at `address`.
    async fn connect(
        &self,
        address: &DeviceAddress,
        on_disconnect: DisconnectNotifier,
    ) -> Result<Self::Connection, TransportError>;

    /// Passively listen for advertising devices for `timeout`.
    async fn discover(&self, timeout: Duration) -> Result<HashSet<DeviceAddress>, TransportError>;
}

/// An open link to one sensor node.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    fn address(&self) -> &DeviceAddress;

    /// Start forwarding notification records to `sink`.
    async fn subscribe(&self, sink: NotificationSink) -> Result<(), TransportError>;

    /// Stop forwarding notification records.
    async fn unsubscribe(&self) -> Result<(), TransportError>;

    /// Write a command and wait for the link-level acknowledgment.
    async fn send_command(&self, command: Command) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
