use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::address::DeviceAddress;
use crate::error::{Error, Result};
use crate::message::{Command, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::transport::{FrameSink, Link, Transport, TransportError};

/// One connection to the robot.
///
/// Owns the only copy of the "notifications active" flag, so starting notifications twice
/// or stopping them when they are off is always a no-op.
pub(crate) struct LinkSession<L> {
    id: u64,
    link: L,
    notifying: bool,
    teardown_timeout: Duration,
}

impl<L: Link> LinkSession<L> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.link.is_connected().await
    }

    pub(crate) async fn start_notifications(&mut self, sink: FrameSink) -> Result<(), TransportError> {
        if self.notifying {
            return Ok(());
        }
        debug!(session = self.id, "start notify");
        match self.link.start_notify(NOTIFY_CHARACTERISTIC_UUID, sink).await {
            Ok(()) => {}
            Err(TransportError::AlreadyNotifying) => debug!(session = self.id, "notify already active"),
            Err(e) => return Err(e),
        }
        self.notifying = true;
        Ok(())
    }

    pub(crate) async fn stop_notifications(&mut self) -> Result<(), TransportError> {
        if !self.notifying {
            return Ok(());
        }
        self.notifying = false;
        debug!(session = self.id, "stop notify");
        match self.link.stop_notify(NOTIFY_CHARACTERISTIC_UUID).await {
            Ok(()) => Ok(()),
            Err(TransportError::NotNotifying) => {
                debug!(session = self.id, "notify was not active");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn write_command(&self, command: Command) -> Result<(), TransportError> {
        let payload = command.payload();
        debug!(session = self.id, ?command, tx = %hex::encode(payload), "write");
        self.link.write(WRITE_CHARACTERISTIC_UUID, payload, true).await
    }

    /// Best effort, a session being thrown away never fails
    pub(crate) async fn disconnect(self) {
        match timeout(self.teardown_timeout, self.link.disconnect()).await {
            Ok(Ok(())) => debug!(session = self.id, "disconnected"),
            Ok(Err(e)) => debug!(session = self.id, error = %e, "disconnect failed, dropping session"),
            Err(_) => debug!(session = self.id, "disconnect timed out, dropping session"),
        }
    }
}

/// Turns an address into a [`LinkSession`], reusing the current one while it is alive.
pub(crate) struct Connector<T> {
    transport: Arc<T>,
    address: DeviceAddress,
    connect_timeout: Duration,
    latest_id: Arc<AtomicU64>,
}

impl<T> Clone for Connector<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            address: self.address.clone(),
            connect_timeout: self.connect_timeout,
            latest_id: self.latest_id.clone(),
        }
    }
}

impl<T: Transport> Connector<T> {
    pub(crate) fn new(transport: Arc<T>, address: DeviceAddress, connect_timeout: Duration) -> Self {
        Self {
            transport,
            address,
            connect_timeout,
            latest_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Id of the most recently created session. Disconnect events from older ones are stale.
    pub(crate) fn latest_id(&self) -> u64 {
        self.latest_id.load(Ordering::Acquire)
    }

    /// Returns `current` if it is still connected, otherwise connects afresh.
    ///
    /// `on_disconnect` is registered with the new connection and called with its session id
    /// from the transport's context.
    pub(crate) async fn ensure_connected<F>(
        &self,
        current: Option<LinkSession<T::Link>>,
        on_disconnect: F,
    ) -> Result<LinkSession<T::Link>>
    where
        F: FnOnce(u64) + Send + 'static,
    {
        if let Some(session) = current {
            if session.is_connected().await {
                return Ok(session);
            }
            debug!(address = %self.address, session = session.id(), "session went stale");
            session.disconnect().await;
        }

        let peer = self
            .transport
            .resolve_peer(&self.address, true)
            .or_else(|| self.transport.resolve_peer(&self.address, false));
        let Some(peer) = peer else {
            debug!(address = %self.address, "peer not found (out of range?)");
            return Err(Error::Unreachable(self.address.clone()));
        };

        let link = match timeout(self.connect_timeout, self.transport.connect(peer, self.connect_timeout)).await {
            Ok(Ok(link)) => link,
            Ok(Err(source)) => {
                debug!(address = %self.address, error = %source, "connect failed");
                return Err(Error::Connect {
                    address: self.address.clone(),
                    source,
                });
            }
            Err(_) => {
                debug!(address = %self.address, "connect timed out");
                return Err(Error::Connect {
                    address: self.address.clone(),
                    source: TransportError::Timeout,
                });
            }
        };

        let id = self.latest_id.fetch_add(1, Ordering::AcqRel) + 1;
        link.on_disconnected(Box::new(move || on_disconnect(id)));
        debug!(address = %self.address, session = id, "connected");

        Ok(LinkSession {
            id,
            link,
            notifying: false,
            teardown_timeout: self.connect_timeout,
        })
    }
}
