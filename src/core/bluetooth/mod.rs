//! Bluetooth side of the die client
//! This module handles scanning, connecting, command dispatch and notification
//! routing on top of a pluggable transport.

#[cfg(feature = "bluest")]
pub mod bluest_transport;
pub mod commands;
pub(crate) mod connection;
pub mod constants;
pub mod manager;
pub mod mock;
pub(crate) mod notification;
pub mod scanner;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
pub use commands::{CommandDispatcher, CommandSender, LinkCommandSender};
pub use constants::*;
pub use manager::DiceManager;
pub use mock::MockTransport;
pub use scanner::BluetoothScanner;
pub use transport::{Connection, Transport};
pub use types::{DisconnectCallback, LinkState, ManufacturerData, RawAdvertisement};
