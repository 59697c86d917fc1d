use std::time::Duration;

use thiserror::Error;

use crate::address::DeviceAddress;
use crate::transport::TransportError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while talking to the robot.
///
/// Only [`Error::InvalidConfig`] is fatal. The rest are retried by the coordinator with
/// backoff and only ever reach a caller as the outcome of a single command.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The peer is out of range or not in the transport's discovery cache
    #[error("{0} is not visible to the transport")]
    Unreachable(DeviceAddress),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: DeviceAddress,
        #[source]
        source: TransportError,
    },

    /// A write or notification subscription failed mid-exchange
    #[error("link operation failed: {0}")]
    Transport(#[from] TransportError),

    #[error("link exchange did not finish within {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("coordinator is stopped")]
    Stopped,
}
