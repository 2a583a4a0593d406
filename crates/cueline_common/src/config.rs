//! Conductor and device configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::{DeviceId, DeviceKind, Duration};

/// Settings to configure the resolve and dispatch loops.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ConductorSettings {
    /// Period of the resolve cycle.
    ///
    /// ## Default
    /// 2500 ms
    pub resolve_interval: Duration,
    /// How far ahead each cycle plans.
    ///
    /// ## Default
    /// 5000 ms
    pub lookahead: Duration,
    /// Maximum number of upcoming change instants evaluated per cycle (besides `now`).
    pub max_events: usize,
    /// Period of each device's dispatch loop (default: 20 ms)
    pub dispatch_interval: Duration,
    /// Entries due within this slack of `now` are executed early (default: 20 ms)
    pub dispatch_tolerance: Duration,
    /// Capacity of the upward event broadcast channel (default: 256)
    ///
    /// Subscribers that fall further behind than this miss events.
    pub event_capacity: usize,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            resolve_interval: 2500,
            lookahead: 5000,
            max_events: 10,
            dispatch_interval: 20,
            dispatch_tolerance: 20,
            event_capacity: 256,
        }
    }
}

/// How to reach a device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// Line-based TCP control protocol.
    Tcp {
        host: String,
        /// Falls back to [`DeviceKind::default_port`].
        #[serde(default)]
        port: Option<u16>,
    },
    /// No hardware: commands are logged and recorded in memory.
    Virtual,
}

/// Registration of one device.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceConfig {
    /// Which adapter drives the device.
    pub kind: DeviceKind,
    /// How the device is reached.
    pub connection: ConnectionConfig,
    /// Adapter-specific options, decoded by the device's factory.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl DeviceConfig {
    /// A device of `kind` reached through `connection`, without options.
    pub fn new(kind: DeviceKind, connection: ConnectionConfig) -> Self {
        Self {
            kind,
            connection,
            options: serde_json::Value::Null,
        }
    }

    /// A virtual device of `kind`.
    pub fn virtual_device(kind: DeviceKind) -> Self {
        Self::new(kind, ConnectionConfig::Virtual)
    }

    /// Replace the adapter options.
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Decode the adapter options, treating missing options as the adapter default.
    pub fn decode_options<T>(&self, device: &DeviceId) -> Result<T, ConfigError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if self.options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.options.clone()).map_err(|e| ConfigError::InvalidOptions {
            device: device.clone(),
            reason: e.to_string(),
        })
    }
}

/// Everything needed to build a conductor and its devices.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ConductorConfig {
    /// Conductor timing and capacity settings.
    #[serde(default)]
    pub settings: ConductorSettings,
    /// Devices to register, by id.
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceConfig>,
}

impl ConductorConfig {
    /// Parse a JSON configuration. Missing sections take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}
