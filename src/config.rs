use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::status_message::FRAME_LEN;

/// Timing and protocol knobs of a [`Coordinator`](crate::Coordinator).
///
/// The defaults match what has been observed to work against the real robot. All fields
/// are optional in a TOML file, anything missing falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Period of the background refresh
    pub refresh_interval_ms: u64,
    /// Upper bound on establishing a connection, and on tearing one down
    pub connect_timeout_ms: u64,
    /// Upper bound on one notify/write/wait exchange over an established connection
    pub exchange_timeout_ms: u64,
    /// How long a refresh waits for the status notification after querying
    pub notify_wait_ms: u64,
    /// First retry delay after a failure
    pub backoff_start_ms: u64,
    /// Retry delays double up to this
    pub backoff_max_ms: u64,
    pub power_on: CommandTiming,
    pub power_off: CommandTiming,
    /// First byte of the in-water indicator in a status frame
    pub in_water_start: usize,
    /// One past the last byte of the in-water indicator
    pub in_water_end: usize,
}

/// Waits of a command exchange: after writing the command, and after the status query
/// that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTiming {
    pub settle_ms: u64,
    pub status_wait_ms: u64,
}

impl CommandTiming {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn status_wait(&self) -> Duration {
        Duration::from_millis(self.status_wait_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 20_000,
            connect_timeout_ms: 6_000,
            exchange_timeout_ms: 5_000,
            notify_wait_ms: 1_000,
            backoff_start_ms: 3_000,
            backoff_max_ms: 30_000,
            power_on: CommandTiming {
                settle_ms: 1_500,
                status_wait_ms: 2_000,
            },
            power_off: CommandTiming {
                settle_ms: 800,
                status_wait_ms: 1_500,
            },
            in_water_start: 16,
            in_water_end: 20,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    /// Reject settings the coordinator could never work with. This runs before a
    /// coordinator is constructed, nothing here is retried.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("refresh_interval_ms", self.refresh_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("exchange_timeout_ms", self.exchange_timeout_ms),
            ("notify_wait_ms", self.notify_wait_ms),
            ("backoff_start_ms", self.backoff_start_ms),
            ("backoff_max_ms", self.backoff_max_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
        }
        if self.backoff_start_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(
                "backoff_start_ms must not exceed backoff_max_ms".to_string(),
            ));
        }
        if self.notify_wait_ms >= self.exchange_timeout_ms {
            return Err(Error::InvalidConfig(
                "notify_wait_ms must be shorter than exchange_timeout_ms".to_string(),
            ));
        }
        for (name, timing) in [("power_on", self.power_on), ("power_off", self.power_off)] {
            if timing.settle_ms + timing.status_wait_ms >= self.exchange_timeout_ms {
                return Err(Error::InvalidConfig(format!(
                    "{name} waits must add up to less than exchange_timeout_ms"
                )));
            }
        }
        if self.in_water_start >= self.in_water_end || self.in_water_end > FRAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "in-water bytes {}..{} must be a non-empty range within the {FRAME_LEN} byte status frame",
                self.in_water_start, self.in_water_end
            )));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    /// Worst case duration of one refresh: connect, exchange, then a forced teardown.
    /// Always longer than the connect timeout alone.
    pub fn refresh_timeout(&self) -> Duration {
        self.connect_timeout() * 2 + self.exchange_timeout()
    }

    pub fn notify_wait(&self) -> Duration {
        Duration::from_millis(self.notify_wait_ms)
    }

    pub fn backoff_start(&self) -> Duration {
        Duration::from_millis(self.backoff_start_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn in_water_bytes(&self) -> Range<usize> {
        self.in_water_start..self.in_water_end
    }
}
