//! Core functionality of the Pixels dice client
//! This module contains the wire protocol, the Bluetooth plumbing and the die handle

pub mod bluetooth;
pub mod die;
pub mod protocol;

// Re-export commonly used types
pub use bluetooth::{DiceManager, LinkState};
pub use die::Die;
pub use die::cache::{AttributeCache, Field, FieldSet};
pub use die::events::{DieEvent, EventKind, HandlerId};
