//! Binding of logical layers to devices.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DeviceId, DeviceKind};

/// Layer name → device placement. Replaced wholesale, never patched.
pub type Mapping = BTreeMap<String, LayerMapping>;

/// Where one logical layer lands.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LayerMapping {
    /// Device the layer is sent to.
    pub device: DeviceId,
    /// Position on that device.
    pub placement: Placement,
}

impl LayerMapping {
    /// Map onto `device` at `placement`.
    pub fn new(device: impl Into<DeviceId>, placement: Placement) -> Self {
        Self {
            device: device.into(),
            placement,
        }
    }

    /// Map onto a media server channel and layer.
    pub fn casparcg(device: impl Into<DeviceId>, channel: u32, layer: u32) -> Self {
        Self::new(device, Placement::CasparCg { channel, layer })
    }

    /// Map onto a recorder deck transport.
    pub fn hyperdeck(device: impl Into<DeviceId>) -> Self {
        Self::new(device, Placement::HyperdeckTransport)
    }

    /// Map onto a router output.
    pub fn router(device: impl Into<DeviceId>, output: u32) -> Self {
        Self::new(device, Placement::Router { output })
    }
}

/// Device-specific placement parameters of a mapped layer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Placement {
    CasparCg {
        #[serde(default = "default_channel")]
        channel: u32,
        layer: u32,
    },
    HyperdeckTransport,
    Router { output: u32 },
}

fn default_channel() -> u32 {
    1
}

impl Placement {
    /// The device kind this placement is meaningful for.
    pub fn device_kind(&self) -> DeviceKind {
        match self {
            Placement::CasparCg { .. } => DeviceKind::CasparCg,
            Placement::HyperdeckTransport => DeviceKind::Hyperdeck,
            Placement::Router { .. } => DeviceKind::Router,
        }
    }
}

/// Iterate the layers of `mapping` that are bound to `device`, in layer-name order.
pub fn layers_for<'a>(
    mapping: &'a Mapping,
    device: &'a DeviceId,
) -> impl Iterator<Item = (&'a String, &'a LayerMapping)> + 'a {
    mapping.iter().filter(move |(_, m)| &m.device == device)
}
