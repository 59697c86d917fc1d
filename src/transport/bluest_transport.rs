//! [`Transport`] on top of the platform's BLE stack via `bluest`.
//!
//! A background scan keeps a cache of every robot advertising the Cosmy service, so looking
//! a peer up never waits for the radio.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{DisconnectCallback, FrameSink, Link, Transport, TransportError};
use crate::address::DeviceAddress;
use crate::message::{NOTIFY_CHARACTERISTIC_UUID, SERVICE_UUID, WRITE_CHARACTERISTIC_UUID};

impl From<bluest::Error> for TransportError {
    fn from(e: bluest::Error) -> Self {
        match e.kind() {
            bluest::error::ErrorKind::NotConnected => TransportError::NotConnected,
            _ => TransportError::Backend(e.to_string()),
        }
    }
}

type PeerCache = Arc<Mutex<HashMap<String, Device>>>;

pub struct BluestTransport {
    adapter: Adapter,
    peers: PeerCache,
    scan: JoinHandle<()>,
}

impl BluestTransport {
    /// Open the default adapter and start scanning for robots
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| TransportError::Backend("default adapter not found".to_string()))?;
        adapter.wait_available().await?;

        let peers = PeerCache::default();
        let scan = tokio::spawn(scan(adapter.clone(), peers.clone()));
        Ok(Self {
            adapter,
            peers,
            scan,
        })
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.scan.abort();
    }
}

async fn scan(adapter: Adapter, peers: PeerCache) {
    let mut advertisements = match adapter.scan(&[SERVICE_UUID]).await {
        Ok(advertisements) => advertisements,
        Err(e) => {
            warn!(error = %e, "scan failed to start");
            return;
        }
    };
    while let Some(advertisement) = advertisements.next().await {
        let device = advertisement.device;
        let key = peer_key(&device);
        let mut peers = peers.lock().unwrap_or_else(PoisonError::into_inner);
        if !peers.contains_key(&key) {
            debug!(peer = %key, rssi = ?advertisement.rssi, "discovered");
        }
        peers.insert(key, device);
    }
    debug!("scan ended");
}

/// The hex digits of the platform's device id.
///
/// Platform ids end in the MAC address (`dev_AA_BB_..` on BlueZ, plain on Windows) or are
/// the peripheral UUID (macOS), so the address is always the trailing digits.
fn peer_key(device: &Device) -> String {
    digits(&format!("{:?}", device.id()))
}

/// The digits before the address belong to the id's prefix, never to the address
fn is_peer(key: &str, wanted: &str) -> bool {
    key.ends_with(wanted)
}

fn digits(s: &str) -> String {
    s.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[async_trait]
impl Transport for BluestTransport {
    type Peer = Device;
    type Link = BluestLink;

    /// Every cached peer advertised recently enough to be connected to, so the
    /// connectable flag does not narrow the lookup.
    fn resolve_peer(&self, address: &DeviceAddress, _connectable: bool) -> Option<Device> {
        let wanted = address.channel_key();
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        peers
            .iter()
            .find(|(key, _)| is_peer(key, &wanted))
            .map(|(_, device)| device.clone())
    }

    async fn connect(&self, device: Device, limit: Duration) -> Result<BluestLink, TransportError> {
        timeout(limit, self.adapter.connect_device(&device))
            .await
            .map_err(|_| TransportError::Timeout)??;

        match discover(&device).await {
            Ok((write, notify)) => Ok(BluestLink {
                adapter: self.adapter.clone(),
                device,
                write,
                notify,
                notify_task: Mutex::new(None),
                watch_task: Mutex::new(None),
            }),
            Err(e) => {
                let _ = self.adapter.disconnect_device(&device).await;
                Err(e)
            }
        }
    }
}

async fn discover(device: &Device) -> Result<(Characteristic, Characteristic), TransportError> {
    let service = device
        .discover_services_with_uuid(SERVICE_UUID)
        .await?
        .first()
        .ok_or(TransportError::MissingCharacteristic(SERVICE_UUID))?
        .clone();
    let write = service
        .discover_characteristics_with_uuid(WRITE_CHARACTERISTIC_UUID)
        .await?
        .first()
        .ok_or(TransportError::MissingCharacteristic(WRITE_CHARACTERISTIC_UUID))?
        .clone();
    let notify = service
        .discover_characteristics_with_uuid(NOTIFY_CHARACTERISTIC_UUID)
        .await?
        .first()
        .ok_or(TransportError::MissingCharacteristic(NOTIFY_CHARACTERISTIC_UUID))?
        .clone();
    Ok((write, notify))
}

pub struct BluestLink {
    adapter: Adapter,
    device: Device,
    write: Characteristic,
    notify: Characteristic,
    notify_task: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluestLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        if uuid == WRITE_CHARACTERISTIC_UUID {
            Ok(&self.write)
        } else if uuid == NOTIFY_CHARACTERISTIC_UUID {
            Ok(&self.notify)
        } else {
            Err(TransportError::MissingCharacteristic(uuid))
        }
    }
}

impl Drop for BluestLink {
    fn drop(&mut self) {
        for task in [&self.notify_task, &self.watch_task] {
            if let Some(task) = task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Link for BluestLink {
    async fn write(&self, characteristic: Uuid, payload: &[u8], with_response: bool) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        if with_response {
            characteristic.write(payload).await?;
        } else {
            characteristic.write_without_response(payload).await?;
        }
        Ok(())
    }

    async fn start_notify(&self, characteristic: Uuid, sink: FrameSink) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?.clone();
        {
            let task = self.notify_task.lock().unwrap_or_else(PoisonError::into_inner);
            if task.as_ref().is_some_and(|task| !task.is_finished()) {
                return Err(TransportError::AlreadyNotifying);
            }
        }

        let (subscribed, subscription) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut frames = match characteristic.notify().await {
                Ok(frames) => {
                    let _ = subscribed.send(Ok(()));
                    frames
                }
                Err(e) => {
                    let _ = subscribed.send(Err(TransportError::from(e)));
                    return;
                }
            };
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => sink(frame),
                    Err(e) => {
                        debug!(error = %e, "notification stream failed");
                        break;
                    }
                }
            }
        });

        match subscription.await {
            Ok(Ok(())) => {
                *self.notify_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Backend("notification task ended".to_string())),
        }
    }

    async fn stop_notify(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.characteristic(characteristic)?;
        match self.notify_task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(task) => {
                // Dropping the stream unsubscribes
                task.abort();
                Ok(())
            }
            None => Err(TransportError::NotNotifying),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    fn on_disconnected(&self, callback: DisconnectCallback) {
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        let task = tokio::spawn(async move {
            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "cannot watch connection events");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if matches!(event, ConnectionEvent::Disconnected) {
                    callback();
                    return;
                }
            }
        });
        if let Some(previous) = self
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }
}
