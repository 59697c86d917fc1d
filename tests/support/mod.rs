//! An in-memory robot behind the transport boundary
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use cosmy::{
    ChannelRegistry, Command, Coordinator, CoordinatorConfig, CoordinatorHandle, DeviceAddress,
    DisconnectCallback, FrameSink, Link, Transport, TransportError,
};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

pub const ADDRESS: &str = "C8:47:8C:00:12:34";

pub const ACK: &str = "005101";
pub const GARBAGE: &str = "0102030405";

pub struct MockState {
    /// Answers to successive lookups, `default_visible` once drained
    pub visibility: VecDeque<bool>,
    pub default_visible: bool,
    pub resolve_attempts: Vec<Instant>,
    pub connects: usize,
    pub disconnects: usize,
    pub writes: Vec<Vec<u8>>,
    pub write_delay: Duration,
    pub fail_writes: bool,
    pub fail_stop_notify: bool,
    /// Sent before the status frame in answer to every status query
    pub noise: Vec<Vec<u8>>,
    /// Whether a status query is answered at all
    pub answer_queries: bool,
    /// Whether power commands change what the robot reports
    pub obey_commands: bool,
    pub cleaning: bool,
    pub minutes: u16,
    pub in_water: bool,
    pub active_writes: usize,
    pub max_active_writes: usize,
    connected: bool,
    sink: Option<FrameSink>,
    on_disconnect: Option<DisconnectCallback>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            visibility: VecDeque::new(),
            default_visible: true,
            resolve_attempts: Vec::new(),
            connects: 0,
            disconnects: 0,
            writes: Vec::new(),
            write_delay: Duration::ZERO,
            fail_writes: false,
            fail_stop_notify: false,
            noise: vec![hex::decode(ACK).unwrap()],
            answer_queries: true,
            obey_commands: true,
            cleaning: false,
            minutes: 0,
            in_water: true,
            active_writes: 0,
            max_active_writes: 0,
            connected: false,
            sink: None,
            on_disconnect: None,
        }
    }
}

impl MockState {
    /// The 20 byte status frame the robot would send right now
    pub fn status_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; 20];
        frame[..5].copy_from_slice(&[0xff, 0xa5, 0x3a, 0x13, 0x84]);
        frame[5] = if self.cleaning { 0x85 } else { 0x04 };
        frame[6..8].copy_from_slice(&self.minutes.to_le_bytes());
        if self.in_water {
            frame[16] = 0x01;
        }
        frame
    }

    pub fn queries(&self) -> usize {
        self.count_writes(Command::QueryStatus)
    }

    pub fn count_writes(&self, command: Command) -> usize {
        self.writes.iter().filter(|w| w.as_slice() == command.payload()).count()
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn set_robot(&self, cleaning: bool, minutes: u16) {
        let mut state = self.state();
        state.cleaning = cleaning;
        state.minutes = minutes;
    }

    /// The robot drops the connection on its own
    pub fn drop_link(&self) {
        let callback = {
            let mut state = self.state();
            state.connected = false;
            state.sink = None;
            state.on_disconnect.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn start(&self, config: CoordinatorConfig) -> CoordinatorHandle {
        let registry = ChannelRegistry::default();
        Coordinator::new(ADDRESS, Arc::new(self.clone()), &registry, config)
            .unwrap()
            .start()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Peer = ();
    type Link = MockLink;

    fn resolve_peer(&self, _address: &DeviceAddress, connectable: bool) -> Option<()> {
        if !connectable {
            return None;
        }
        let mut state = self.state();
        state.resolve_attempts.push(Instant::now());
        let default = state.default_visible;
        state.visibility.pop_front().unwrap_or(default).then_some(())
    }

    async fn connect(&self, _peer: (), _timeout: Duration) -> Result<MockLink, TransportError> {
        let mut state = self.state();
        state.connects += 1;
        state.connected = true;
        Ok(MockLink {
            state: self.state.clone(),
        })
    }
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Link for MockLink {
    async fn write(&self, _characteristic: Uuid, payload: &[u8], _with_response: bool) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.active_writes += 1;
            state.max_active_writes = state.max_active_writes.max(state.active_writes);
            state.write_delay
        };
        sleep(delay).await;

        let (sink, replies) = {
            let mut state = self.state();
            state.active_writes -= 1;
            if state.fail_writes {
                return Err(TransportError::Backend("write rejected".to_string()));
            }
            state.writes.push(payload.to_vec());

            let mut replies = state.noise.clone();
            if payload == Command::PowerOn.payload() && state.obey_commands {
                state.cleaning = true;
                state.minutes = 90;
            } else if payload == Command::PowerOff.payload() && state.obey_commands {
                state.cleaning = false;
                state.minutes = 0;
            } else if payload == Command::QueryStatus.payload() && state.answer_queries {
                replies.push(state.status_frame());
            }
            (state.sink.clone(), replies)
        };

        if let Some(sink) = sink {
            for frame in replies {
                sink(frame);
            }
        }
        Ok(())
    }

    async fn start_notify(&self, _characteristic: Uuid, sink: FrameSink) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.sink.is_some() {
            return Err(TransportError::AlreadyNotifying);
        }
        state.sink = Some(sink);
        Ok(())
    }

    async fn stop_notify(&self, _characteristic: Uuid) -> Result<(), TransportError> {
        let mut state = self.state();
        match state.sink.take() {
            Some(_) if state.fail_stop_notify => Err(TransportError::Backend("unsubscribe rejected".to_string())),
            Some(_) => Ok(()),
            None => Err(TransportError::NotNotifying),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.disconnects += 1;
        state.connected = false;
        state.sink = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn on_disconnected(&self, callback: DisconnectCallback) {
        self.state().on_disconnect = Some(callback);
    }
}
