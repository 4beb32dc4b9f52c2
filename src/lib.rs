//! Client library for Pixels smart dice over Bluetooth Low Energy.
//!
//! Scan with a [`DiceManager`], turn a [`ScanResult`] into a [`Die`] handle,
//! connect, and then query the die or subscribe to its events.

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use crate::config::LinkConfig;
pub use crate::core::protocol::ScanResult;
pub use crate::core::{
    AttributeCache, DiceManager, Die, DieEvent, EventKind, Field, FieldSet, HandlerId, LinkState,
};
pub use crate::error::{DecodeError, PixelsError, Result, TransportError};
