//! Error types shared across the crate.

use thiserror::Error;
use uuid::Uuid;

use crate::core::protocol::MessageKind;

/// Failures reported by the transport capability.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("write to {characteristic} failed: {reason}")]
    WriteFailed { characteristic: Uuid, reason: String },

    #[error("subscribe to {characteristic} failed: {reason}")]
    SubscribeFailed { characteristic: Uuid, reason: String },

    #[error("link is not connected")]
    NotConnected,

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// A single advertisement or frame could not be decoded.
///
/// Never fatal: the offending unit is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unrecognized message id {0:#04x}")]
    UnknownMessage(u8),

    #[error("bad length for {kind:?}: expected {expected}, got {got}")]
    Length {
        kind: MessageKind,
        expected: usize,
        got: usize,
    },

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u8 },

    #[error("invalid utf-8 in {0:?}")]
    Utf8(MessageKind),

    #[error("advertisement is not from a die")]
    NotADie,

    #[error("incomplete advertisement: expected {expected} bytes, got {got}")]
    Incomplete { expected: usize, got: usize },
}

/// Error type for die operations.
#[derive(Error, Debug)]
pub enum PixelsError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("timed out waiting for {kind:?}")]
    Timeout { kind: MessageKind },

    #[error("die disconnected")]
    Disconnected,

    #[error("die is not connected")]
    NotConnected,

    #[error("unexpected response {got:?} while waiting for {expected:?}")]
    UnexpectedResponse {
        expected: MessageKind,
        got: MessageKind,
    },
}

/// An application event handler returned an error or panicked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler {handler} for {event} failed: {message}")]
pub struct HandlerError {
    pub event: String,
    pub handler: u64,
    pub message: String,
}

pub type Result<T, E = PixelsError> = std::result::Result<T, E>;
