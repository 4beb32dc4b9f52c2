//! Pixels wire protocol: advertisements and connection frames.

pub mod advertisement;
pub mod codec;
pub mod messages;

pub use advertisement::{ScanResult, decode_advertisement};
pub use codec::{decode, encode};
pub use messages::{
    BatteryLevel, BatteryState, Blink, BlinkId, DesignAndColor, DieFlavor, IAmADie, Message,
    MessageKind, NotifyUser, OkCancel, RequestMode, RequestRssi, RollState, RollStateKind,
    Telemetry, Temperature,
};
