//! Decoder capability contract.
//!
//! A device profile implements [`DeviceDecoder`] for everything that happens
//! after a session exists, and [`DecoderProfile`] for the static facts the
//! registry needs before any connection is made.

use crate::domain::models::{DeviceType, GattWrite, SampleRecord, StreamKind, Timestamp};
use crate::error::{HrmError, Result};
use std::collections::BTreeSet;
use uuid::Uuid;

pub trait DeviceDecoder: Send + Sync {
    fn device_type(&self) -> DeviceType;

    fn stream_kinds(&self) -> &'static [StreamKind];

    fn supports(&self, kind: StreamKind) -> bool {
        self.stream_kinds().contains(&kind)
    }

    /// Characteristics that must be subscribed to produce `kind`.
    fn required_characteristics(&self, kind: StreamKind) -> Result<BTreeSet<Uuid>>;

    /// Writes issued once the characteristics for `kind` are subscribed.
    fn start_commands(&self, _kind: StreamKind) -> Vec<GattWrite> {
        Vec::new()
    }

    /// Writes issued before the characteristics for `kind` are released.
    fn stop_commands(&self, _kind: StreamKind) -> Vec<GattWrite> {
        Vec::new()
    }

    /// Turns one notification into zero or more samples of `kind`.
    ///
    /// Frames that belong to another measurement sharing the same
    /// characteristic decode to an empty batch.
    fn decode(
        &self,
        kind: StreamKind,
        characteristic: Uuid,
        payload: &[u8],
        received_at: Timestamp,
    ) -> Result<Vec<SampleRecord>>;

    fn unsupported(&self, kind: StreamKind) -> HrmError {
        HrmError::UnsupportedStreamKind {
            device: self.device_type(),
            kind,
        }
    }
}

/// Static side of a device profile, evaluated without a connection.
pub trait DecoderProfile: DeviceDecoder + Default + 'static {
    const DEVICE_TYPE: DeviceType;
    const STREAM_KINDS: &'static [StreamKind];

    fn is_supported(device_name: &str) -> bool;
}
