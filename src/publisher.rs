//! Fan-out of the robot's state to any number of observers.
//!
//! Every device gets one [`DeviceChannels`] in a [`ChannelRegistry`], looked up by its
//! address. Broadcasts are fire-and-forget: nothing is replayed to late subscribers, they
//! read [`DeviceChannels::current`] when they subscribe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::address::DeviceAddress;
use crate::device_state::DeviceState;

/// Broadcast on the state channel. Both fields are `None` while the robot is unreachable,
/// so "idle" and "unknown" are never confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleaningUpdate {
    pub cleaning: Option<bool>,
    pub minutes: Option<u16>,
}

impl CleaningUpdate {
    pub fn from_state(state: &DeviceState) -> Self {
        if !state.available {
            return Self {
                cleaning: None,
                minutes: None,
            };
        }
        Self {
            cleaning: state.cleaning,
            minutes: Some(state.minutes_remaining),
        }
    }
}

/// The typed channels of one device
pub struct DeviceChannels {
    state: broadcast::Sender<CleaningUpdate>,
    minutes: broadcast::Sender<Option<u16>>,
    in_water: broadcast::Sender<Option<bool>>,
    refresh: broadcast::Sender<()>,
    snapshot: watch::Sender<DeviceState>,
}

impl DeviceChannels {
    fn new(capacity: usize) -> Self {
        Self {
            state: broadcast::channel(capacity).0,
            minutes: broadcast::channel(capacity).0,
            in_water: broadcast::channel(capacity).0,
            // Requests only need to be noticed, not counted
            refresh: broadcast::channel(1).0,
            snapshot: watch::channel(DeviceState::UNAVAILABLE).0,
        }
    }

    pub fn subscribe_state(&self) -> Subscription<CleaningUpdate> {
        Subscription::new(self.state.subscribe())
    }

    pub fn subscribe_minutes(&self) -> Subscription<Option<u16>> {
        Subscription::new(self.minutes.subscribe())
    }

    pub fn subscribe_in_water(&self) -> Subscription<Option<bool>> {
        Subscription::new(self.in_water.subscribe())
    }

    /// The latest published state
    pub fn current(&self) -> DeviceState {
        *self.snapshot.borrow()
    }

    /// Receiver that always holds the latest published state
    pub fn watch(&self) -> watch::Receiver<DeviceState> {
        self.snapshot.subscribe()
    }

    /// Ask the device's coordinator for an out-of-band refresh. Returns false when no
    /// coordinator is listening.
    pub fn request_refresh(&self) -> bool {
        self.refresh.send(()).is_ok()
    }

    pub(crate) fn refresh_requests(&self) -> broadcast::Receiver<()> {
        self.refresh.subscribe()
    }
}

/// Per-device channels keyed by the address's channel key
pub struct ChannelRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceChannels>>>,
    capacity: usize,
}

impl ChannelRegistry {
    /// `capacity` is how far a subscriber may lag before it starts missing updates
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// The channels of `address`, created on first use
    pub fn channels(&self, address: &DeviceAddress) -> Arc<DeviceChannels> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices
            .entry(address.channel_key())
            .or_insert_with(|| Arc::new(DeviceChannels::new(self.capacity)))
            .clone()
    }

    pub fn request_refresh(&self, address: &DeviceAddress) -> bool {
        self.channels(address).request_refresh()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new(16)
    }
}

/// A registration on one channel. Dropping it unsubscribes.
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// The next update. Updates a slow subscriber missed are skipped, so this yields the
    /// oldest one still buffered. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "subscriber lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The next update if one is already waiting
    pub fn try_recv(&mut self) -> Option<T> {
        use broadcast::error::TryRecvError;
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// Publishes one device's state to its channels
pub(crate) struct StatePublisher {
    address: DeviceAddress,
    channels: Arc<DeviceChannels>,
    closed: bool,
}

impl StatePublisher {
    pub(crate) fn new(address: DeviceAddress, channels: Arc<DeviceChannels>) -> Self {
        Self {
            address,
            channels,
            closed: false,
        }
    }

    pub(crate) fn publish(&self, state: &DeviceState) {
        if self.closed {
            return;
        }
        let update = CleaningUpdate::from_state(state);
        let in_water = if state.available { state.in_water } else { None };
        debug!(
            address = %self.address,
            cleaning = ?update.cleaning,
            minutes = ?update.minutes,
            in_water = ?in_water,
            "publish"
        );

        // Subscribers reading `current` on an update must see that update
        self.channels.snapshot.send_replace(*state);
        // Nobody listening is fine
        let _ = self.channels.minutes.send(update.minutes);
        let _ = self.channels.state.send(update);
        let _ = self.channels.in_water.send(in_water);
    }

    /// No broadcast goes out after this
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> DeviceAddress {
        DeviceAddress::parse("aa:bb:cc:dd:ee:ff").unwrap()
    }

    fn cleaning_state() -> DeviceState {
        DeviceState {
            available: true,
            cleaning: Some(true),
            minutes_remaining: 30,
            in_water: Some(true),
        }
    }

    #[test]
    fn registry_keys_by_physical_device() {
        let registry = ChannelRegistry::default();
        let a = registry.channels(&DeviceAddress::parse("aa:bb:cc:dd:ee:ff").unwrap());
        let b = registry.channels(&DeviceAddress::parse("AA:BB:CC:DD:EE:FF").unwrap());
        let other = registry.channels(&DeviceAddress::parse("11:22:33:44:55:66").unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn every_subscriber_sees_the_same_update() {
        let registry = ChannelRegistry::default();
        let channels = registry.channels(&address());
        let mut switch = channels.subscribe_state();
        let mut gauge = channels.subscribe_minutes();
        let mut moisture = channels.subscribe_in_water();

        let publisher = StatePublisher::new(address(), channels.clone());
        publisher.publish(&cleaning_state());

        assert_eq!(
            switch.try_recv(),
            Some(CleaningUpdate {
                cleaning: Some(true),
                minutes: Some(30)
            })
        );
        assert_eq!(gauge.try_recv(), Some(Some(30)));
        assert_eq!(moisture.try_recv(), Some(Some(true)));
        assert_eq!(channels.current(), cleaning_state());
    }

    #[test]
    fn unavailable_publishes_unknown_not_stale_values() {
        let registry = ChannelRegistry::default();
        let channels = registry.channels(&address());
        let mut switch = channels.subscribe_state();
        let mut gauge = channels.subscribe_minutes();
        let mut moisture = channels.subscribe_in_water();

        let publisher = StatePublisher::new(address(), channels.clone());
        // Unreachable, but still remembering it was cleaning
        let state = DeviceState {
            available: false,
            ..cleaning_state()
        };
        publisher.publish(&state);

        assert_eq!(
            switch.try_recv(),
            Some(CleaningUpdate {
                cleaning: None,
                minutes: None
            })
        );
        assert_eq!(gauge.try_recv(), Some(None));
        assert_eq!(moisture.try_recv(), Some(None));
    }

    #[test]
    fn closed_publisher_stays_quiet() {
        let registry = ChannelRegistry::default();
        let channels = registry.channels(&address());
        let mut switch = channels.subscribe_state();

        let mut publisher = StatePublisher::new(address(), channels.clone());
        publisher.close();
        publisher.publish(&cleaning_state());

        assert_eq!(switch.try_recv(), None);
        assert_eq!(channels.current(), DeviceState::UNAVAILABLE);
    }

    #[test]
    fn late_subscriber_reads_current_state() {
        let registry = ChannelRegistry::default();
        let channels = registry.channels(&address());
        StatePublisher::new(address(), channels.clone()).publish(&cleaning_state());

        let mut late = channels.subscribe_state();
        assert_eq!(late.try_recv(), None);
        assert_eq!(channels.current(), cleaning_state());
        assert_eq!(*channels.watch().borrow(), cleaning_state());
    }

    #[test]
    fn refresh_request_needs_a_listener() {
        let registry = ChannelRegistry::default();
        assert!(!registry.request_refresh(&address()));

        let mut listener = registry.channels(&address()).refresh_requests();
        assert!(registry.request_refresh(&address()));
        assert!(listener.try_recv().is_ok());
    }
}
