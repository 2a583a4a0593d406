//! Constructors for devices declared in configuration, keyed by device kind.

use std::collections::HashMap;
use std::sync::Arc;

use cueline_common::error::ConfigError;
use cueline_common::{ConductorSettings, DeviceConfig, DeviceId, DeviceKind};

use crate::device::ManagedDevice;

/// Builds one device from its configuration.
pub type DeviceFactory = Arc<
    dyn Fn(&DeviceId, &DeviceConfig, &ConductorSettings) -> Result<Arc<dyn ManagedDevice>, ConfigError>
        + Send
        + Sync,
>;

/// Registered device factories.
#[derive(Clone, Default)]
pub struct DeviceFactories {
    factories: HashMap<DeviceKind, DeviceFactory>,
}

impl std::fmt::Debug for DeviceFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFactories")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DeviceFactories {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `kind`, replacing any earlier one.
    pub fn register<F>(&mut self, kind: DeviceKind, factory: F) -> &mut Self
    where
        F: Fn(&DeviceId, &DeviceConfig, &ConductorSettings) -> Result<Arc<dyn ManagedDevice>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    /// Build the device `id` from `config`.
    pub fn build(
        &self,
        id: &DeviceId,
        config: &DeviceConfig,
        settings: &ConductorSettings,
    ) -> Result<Arc<dyn ManagedDevice>, ConfigError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| ConfigError::UnsupportedKind {
                device: id.clone(),
                kind: config.kind,
            })?;
        factory(id, config, settings)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<DeviceKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
