//! Error taxonomy shared by the registry, decoders and streaming sessions.

use crate::domain::models::{DeviceType, StreamKind};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, HrmError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HrmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription to {characteristic} failed: {reason}")]
    SubscriptionFailed { characteristic: Uuid, reason: String },

    #[error("Reading {characteristic} failed: {reason}")]
    ReadFailed { characteristic: Uuid, reason: String },

    #[error("No registered decoder supports device {0:?}")]
    UnsupportedDevice(String),

    #[error("{device} does not provide a {kind} stream")]
    UnsupportedStreamKind { device: DeviceType, kind: StreamKind },

    #[error("Decoder for {0} is already registered")]
    DuplicateRegistration(DeviceType),

    #[error("Malformed {kind} payload ({len} bytes): {reason}")]
    MalformedPayload {
        kind: StreamKind,
        len: usize,
        reason: String,
    },

    #[error("Callback is already registered for the {0} stream")]
    AlreadyStreaming(StreamKind),

    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Unknown stream kind: {0}")]
    UnknownStreamKind(String),
}

impl HrmError {
    pub(crate) fn malformed(kind: StreamKind, payload: &[u8], reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            len: payload.len(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by a peripheral handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "ble-central")]
impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::NotConnected,
            other => Self::Other(other.to_string()),
        }
    }
}
