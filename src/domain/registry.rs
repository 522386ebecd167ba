//! Decoder Registry
//!
//! Catalog of known device profiles. Populate it once at startup with
//! [`Registry::register`] (or [`Registry::with_builtin_decoders`]) and treat
//! it as read-only afterwards; [`install`] and [`global`] expose one
//! process-wide instance.

use crate::domain::decoder::{DecoderProfile, DeviceDecoder};
use crate::domain::models::{DeviceType, PeripheralIdentity, StreamKind};
use crate::domain::session::StreamingSession;
use crate::error::{HrmError, Result};
use crate::infrastructure::bluetooth::Peripheral;
use crate::protocol::{
    cl800::Cl800, garmin_hrm_pro::GarminHrmPro, mock_sensor::MockSensor, movesense::Movesense,
    polar_h10::PolarH10,
};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::OnceLock;
use tracing::{debug, info};

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// One registered device profile.
#[derive(Clone, Copy)]
pub struct DecoderDescriptor {
    pub device_type: DeviceType,
    pub stream_kinds: &'static [StreamKind],
    pub is_supported: fn(&str) -> bool,
    pub build: fn() -> Box<dyn DeviceDecoder>,
}

impl DecoderDescriptor {
    pub fn of<P: DecoderProfile>() -> Self {
        Self {
            device_type: P::DEVICE_TYPE,
            stream_kinds: P::STREAM_KINDS,
            is_supported: P::is_supported,
            build: build_decoder::<P>,
        }
    }
}

fn build_decoder<P: DecoderProfile>() -> Box<dyn DeviceDecoder> {
    Box::new(P::default())
}

impl std::fmt::Debug for DecoderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderDescriptor")
            .field("device_type", &self.device_type)
            .field("stream_kinds", &self.stream_kinds)
            .finish_non_exhaustive()
    }
}

/// A discovered peripheral that some registered decoder recognises.
#[derive(Debug, Clone, Serialize)]
pub struct SupportedPeripheral {
    pub identity: PeripheralIdentity,
    pub device_type: DeviceType,
    pub stream_kinds: &'static [StreamKind],
}

#[derive(Debug, Default)]
pub struct Registry {
    descriptors: Vec<DecoderDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every profile shipped with this crate.
    pub fn with_builtin_decoders() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin_descriptors() {
            let registered = registry.register(descriptor);
            debug_assert!(registered.is_ok(), "builtin decoders clash: {registered:?}");
        }
        registry
    }

    pub fn register(&mut self, descriptor: DecoderDescriptor) -> Result<()> {
        if self
            .descriptors
            .iter()
            .any(|d| d.device_type == descriptor.device_type)
        {
            return Err(HrmError::DuplicateRegistration(descriptor.device_type));
        }
        debug!("Registered decoder {}", descriptor.device_type);
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn register_profile<P: DecoderProfile>(&mut self) -> Result<()> {
        self.register(DecoderDescriptor::of::<P>())
    }

    /// Device-type tags in registration order.
    pub fn registered_types(&self) -> Vec<DeviceType> {
        self.descriptors.iter().map(|d| d.device_type).collect()
    }

    pub fn supported_stream_kinds(&self, device_type: DeviceType) -> Option<&'static [StreamKind]> {
        self.descriptor(device_type).map(|d| d.stream_kinds)
    }

    /// First registered profile whose predicate accepts `device_name`.
    pub fn match_name(&self, device_name: &str) -> Option<DeviceType> {
        self.match_descriptor(device_name).map(|d| d.device_type)
    }

    pub fn match_device(&self, identity: &PeripheralIdentity) -> Option<DeviceType> {
        identity.name.as_deref().and_then(|name| self.match_name(name))
    }

    pub fn list_supported<'a>(
        &self,
        identities: impl IntoIterator<Item = &'a PeripheralIdentity>,
    ) -> Vec<SupportedPeripheral> {
        identities
            .into_iter()
            .filter_map(|identity| {
                let name = identity.name.as_deref()?;
                let descriptor = self.match_descriptor(name)?;
                Some(SupportedPeripheral {
                    identity: identity.clone(),
                    device_type: descriptor.device_type,
                    stream_kinds: descriptor.stream_kinds,
                })
            })
            .collect()
    }

    /// Bind a new, not yet connected session to `peripheral`.
    pub fn create_session(&self, peripheral: Box<dyn Peripheral>) -> Result<StreamingSession> {
        let identity = peripheral.identity().clone();
        let descriptor = identity
            .name
            .as_deref()
            .and_then(|name| self.match_descriptor(name))
            .ok_or_else(|| HrmError::UnsupportedDevice(identity.display_name().to_string()))?;

        info!(
            "Creating {} session for {} ({})",
            descriptor.device_type,
            identity.display_name(),
            identity.address
        );
        Ok(StreamingSession::new(peripheral, (descriptor.build)()))
    }

    fn descriptor(&self, device_type: DeviceType) -> Option<&DecoderDescriptor> {
        self.descriptors.iter().find(|d| d.device_type == device_type)
    }

    fn match_descriptor(&self, device_name: &str) -> Option<&DecoderDescriptor> {
        self.descriptors.iter().find(|d| (d.is_supported)(device_name))
    }
}

pub fn builtin_descriptors() -> [DecoderDescriptor; 5] {
    [
        DecoderDescriptor::of::<PolarH10>(),
        DecoderDescriptor::of::<GarminHrmPro>(),
        DecoderDescriptor::of::<Movesense>(),
        DecoderDescriptor::of::<Cl800>(),
        DecoderDescriptor::of::<MockSensor>(),
    ]
}

/// Install the process-wide registry. Fails, returning it, if one is already set.
pub fn install(registry: Registry) -> std::result::Result<(), Registry> {
    GLOBAL.set(registry)
}

/// The process-wide registry, defaulting to the builtin profiles.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::with_builtin_decoders)
}

/// Render a listing as a plain-text table.
pub fn format_device_table(devices: &[SupportedPeripheral]) -> String {
    if devices.is_empty() {
        return "No supported devices found.".to_string();
    }

    let headers = ["Name", "Address", "Type", "Streams"];
    let rows: Vec<[String; 4]> = devices
        .iter()
        .map(|d| {
            [
                d.identity.display_name().to_string(),
                d.identity.address.clone(),
                d.device_type.to_string(),
                d.stream_kinds
                    .iter()
                    .map(StreamKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: [&str; 4]| {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        let _ = writeln!(out, "{}", line.trim_end());
    };
    push_row(headers);
    push_row(widths.map(|w| "-".repeat(w)).each_ref().map(String::as_str));
    for row in &rows {
        push_row(row.each_ref().map(String::as_str));
    }
    out
}
