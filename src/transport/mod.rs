//! The boundary to the BLE stack.
//!
//! The coordinator never talks to a Bluetooth library directly. It is handed a
//! [`Transport`] which can look a peer up and connect to it, and gets back a [`Link`]
//! for the connection. Both run their callbacks on whatever execution context the
//! BLE stack uses: callbacks must only forward what they got into a channel, never
//! touch coordinator state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::address::DeviceAddress;

#[cfg(feature = "bluest")]
pub mod bluest_transport;

#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;

/// Receives every notification frame, called from the transport's context
pub type FrameSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called at most once when the peer drops the connection, from the transport's context
pub type DisconnectCallback = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    /// Benign, the subscription is already in place
    #[error("notifications are already enabled")]
    AlreadyNotifying,
    /// Benign, there is nothing to unsubscribe from
    #[error("notifications are not enabled")]
    NotNotifying,
    #[error("operation timed out")]
    Timeout,
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whatever the transport needs to connect to a peer it has seen
    type Peer: Send + 'static;
    type Link: Link;

    /// Look the peer up in the transport's discovery cache. Never blocks, `None` means
    /// the peer is out of range or not seen yet.
    fn resolve_peer(&self, address: &DeviceAddress, connectable: bool) -> Option<Self::Peer>;

    async fn connect(&self, peer: Self::Peer, timeout: Duration) -> Result<Self::Link, TransportError>;
}

/// One live connection to the peer
#[async_trait]
pub trait Link: Send + Sync + 'static {
    async fn write(
        &self,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<(), TransportError>;

    async fn start_notify(&self, characteristic: Uuid, sink: FrameSink) -> Result<(), TransportError>;

    async fn stop_notify(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    fn on_disconnected(&self, callback: DisconnectCallback);
}
