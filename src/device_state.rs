use crate::message::StatusMessage;

/// The last known state of the robot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceState {
    /// Whether the robot is currently reachable
    pub available: bool,
    /// Whether a cleaning cycle is running, `None` until the robot has reported it
    pub cleaning: Option<bool>,
    /// Minutes left in the running cycle. 0 when idle or unavailable.
    pub minutes_remaining: u16,
    /// Whether the robot reports being in the water, `None` until known
    pub in_water: Option<bool>,
}

impl DeviceState {
    pub const UNAVAILABLE: Self = Self {
        available: false,
        cleaning: None,
        minutes_remaining: 0,
        in_water: None,
    };

    pub(crate) fn apply_status(&mut self, status: &StatusMessage) {
        self.available = true;
        self.cleaning = Some(status.cleaning);
        self.minutes_remaining = status.minutes_remaining;
        self.in_water = Some(status.in_water);
    }

    /// The last cleaning flag is kept, it is never published while unavailable.
    pub(crate) fn mark_unavailable(&mut self) {
        self.available = false;
        self.minutes_remaining = 0;
        self.in_water = None;
    }

    /// Tentative state shown while a command is in flight, until the robot confirms it
    pub(crate) fn assume_cleaning(&mut self, cleaning: bool) {
        self.available = true;
        self.cleaning = Some(cleaning);
        if !cleaning {
            self.minutes_remaining = 0;
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::UNAVAILABLE;
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::UNAVAILABLE
    }
}

#[test]
fn test_status_then_disconnect() {
    let mut state = DeviceState::default();
    state.apply_status(&StatusMessage {
        cleaning: true,
        minutes_remaining: 42,
        in_water: true,
    });
    assert_eq!(
        state,
        DeviceState {
            available: true,
            cleaning: Some(true),
            minutes_remaining: 42,
            in_water: Some(true)
        }
    );

    state.mark_unavailable();
    assert!(!state.available);
    assert_eq!(state.minutes_remaining, 0);
    assert_eq!(state.in_water, None);

    state.reset();
    assert_eq!(state, DeviceState::UNAVAILABLE);
}

#[test]
fn test_assume_stopped_clears_minutes() {
    let mut state = DeviceState::default();
    state.apply_status(&StatusMessage {
        cleaning: true,
        minutes_remaining: 42,
        in_water: true,
    });
    state.assume_cleaning(false);
    assert_eq!(state.cleaning, Some(false));
    assert_eq!(state.minutes_remaining, 0);
    assert_eq!(state.in_water, Some(true));
}
