pub mod timeline;
pub use timeline::*;

pub mod mapping;
pub use mapping::*;

pub mod state;
pub use state::*;

pub mod command;
pub use command::*;

pub mod config;
pub use config::*;

pub mod error;

use serde::{Deserialize, Serialize};

use std::borrow::Borrow;
use std::fmt::Display;

/// Milliseconds since the Unix epoch.
///
/// Every component (clock, resolver, scheduler, adapters) shares this unit.
pub type Time = i64;

/// A span of time in milliseconds.
pub type Duration = i64;

#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
#[serde(transparent)]
/// A [`DeviceId`] names a single registered device.
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of device kinds cueline can drive.
#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// CasparCG-style media server (channels and layers).
    CasparCg,
    /// HyperDeck-style disk recorder / deck.
    Hyperdeck,
    /// Video router (crosspoint switcher).
    Router,
}

impl DeviceKind {
    /// Control port the device listens on when the configuration omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            DeviceKind::CasparCg => 5250,
            DeviceKind::Hyperdeck => 9993,
            DeviceKind::Router => 9990,
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceKind::CasparCg => "casparcg",
            DeviceKind::Hyperdeck => "hyperdeck",
            DeviceKind::Router => "router",
        };
        f.write_str(name)
    }
}

/// Connection state of a device as last reported by its driver.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}
