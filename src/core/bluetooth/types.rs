//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Manufacturer-specific advertisement data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// One advertisement as delivered by the transport's discovery stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// The address of the device (MAC address on most platforms, an opaque id on macOS)
    pub address: String,
    /// The advertised local name, if any
    pub local_name: Option<String>,
    /// The signal strength (RSSI) of the advertisement
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<ManufacturerData>,
    pub services: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

/// Connection lifecycle of a single die.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Discovering,
    /// Subscribed and routing notifications
    Ready,
    Disconnecting,
}

impl LinkState {
    /// Advertisement-sourced fields may only be written in these states.
    pub fn accepts_advertisements(self) -> bool {
        matches!(self, Self::Disconnected | Self::Connecting)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Invoked by the transport when the link drops without being asked to.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;
