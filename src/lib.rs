//! Keep track of a BWT Cosmy pool cleaning robot over Bluetooth Low Energy
//!
//! The robot speaks a small proprietary protocol on top of two GATT characteristics: fixed
//! command frames are written to one, acknowledgements and 20 byte status frames come back
//! as notifications on the other. The robot is battery powered and drops out of range
//! whenever it dives, so connections are short lived and failures are the normal case.
//!
//! A [`Coordinator`] owns one robot. It refreshes the status periodically and on demand,
//! never runs two exchanges with the robot at the same time, backs off while the robot is
//! unreachable and publishes every change on the robot's [`DeviceChannels`]:
//!
//! - whether the robot is cleaning and how many minutes of the cycle remain,
//! - the remaining minutes on their own,
//! - whether the robot is in the water.
//!
//! All of these are `None` while the robot is unreachable.
//!
//! The BLE stack is abstracted behind [`Transport`]. With the `bluest` feature enabled,
//! [`transport::BluestTransport`] uses the platform's Bluetooth adapter.
//!
//! # Example
//!
//! ```rust,no_run
//! # #[cfg(feature = "bluest")]
//! # #[tokio::main]
//! # pub async fn main() {
//!     use std::sync::Arc;
//!     use cosmy::{ChannelRegistry, Coordinator, CoordinatorConfig};
//!
//!     let transport = Arc::new(cosmy::transport::BluestTransport::new().await.unwrap());
//!     let registry = ChannelRegistry::default();
//!     let coordinator = Coordinator::new("C8:47:8C:00:12:34", transport, &registry, CoordinatorConfig::default()).unwrap();
//!     let handle = coordinator.start();
//!
//!     let mut updates = handle.channels().subscribe_state();
//!     while let Some(update) = updates.recv().await {
//!         println!("{update:?}");
//!     }
//! # }
//! # #[cfg(not(feature = "bluest"))]
//! # fn main() {}
//! ```

mod address;
mod config;
mod coordinator;
mod device_state;
mod error;
mod link;
pub mod message;
mod publisher;
mod scheduler;
pub mod transport;

pub use address::DeviceAddress;
pub use config::{CommandTiming, CoordinatorConfig};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use device_state::DeviceState;
pub use error::{Error, Result};
pub use message::{Command, Frame, StatusMessage};
pub use publisher::{ChannelRegistry, CleaningUpdate, DeviceChannels, Subscription};
pub use transport::{DisconnectCallback, FrameSink, Link, Transport, TransportError};
