#![deny(
    missing_docs,
    trivial_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]

//! Concrete devices for cueline: a media server, a recorder deck and a video
//! router, each reachable over a line-based TCP protocol or as a virtual
//! device that only logs what it would do.
//!
//! [`register_default_devices`] fills a [`DeviceFactories`] table so devices
//! can be declared in a [`cueline::ConductorConfig`].

use std::sync::Arc;

use cueline::error::ConfigError;
use cueline::{
    ConductorSettings, ConnectionConfig, DeviceAdapter, DeviceConfig, DeviceFactories,
    DeviceHandle, DeviceId, DeviceKind, ManagedDevice,
};

/// Media server adapter
pub mod casparcg;
/// Recorder deck adapter
pub mod hyperdeck;
/// In-memory driver for virtual devices
pub mod loopback;
/// Video router adapter
pub mod router;
/// Line-based TCP driver
pub mod tcp;

pub use casparcg::{CasparAdapter, CasparCommand, CasparOptions, CasparState};
pub use hyperdeck::{DeckAdapter, DeckCommand, DeckOptions, DeckState, NotifyState};
pub use loopback::LoopbackDriver;
pub use router::{RouterAdapter, RouterCommand, RouterOptions, RouterState};
pub use tcp::{TcpDriver, TcpSettings, WireCommand};

/// Register constructors for every device kind in this crate.
pub fn register_default_devices(factories: &mut DeviceFactories) -> &mut DeviceFactories {
    factories
        .register(DeviceKind::CasparCg, |id, config, settings| {
            let adapter = CasparAdapter::new(config.decode_options(id)?);
            build(id, config, settings, adapter)
        })
        .register(DeviceKind::Hyperdeck, |id, config, settings| {
            let adapter = DeckAdapter::new(config.decode_options(id)?);
            build(id, config, settings, adapter)
        })
        .register(DeviceKind::Router, |id, config, settings| {
            let adapter = RouterAdapter::new(config.decode_options(id)?);
            build(id, config, settings, adapter)
        })
}

/// A factory table with every device kind in this crate registered.
pub fn default_factories() -> DeviceFactories {
    let mut factories = DeviceFactories::new();
    register_default_devices(&mut factories);
    factories
}

fn build<A>(
    id: &DeviceId,
    config: &DeviceConfig,
    settings: &ConductorSettings,
    adapter: A,
) -> Result<Arc<dyn ManagedDevice>, ConfigError>
where
    A: DeviceAdapter,
    A::Command: WireCommand,
{
    let tolerance = settings.dispatch_tolerance;
    let device: Arc<dyn ManagedDevice> = match &config.connection {
        ConnectionConfig::Tcp { host, port } => {
            if host.is_empty() {
                return Err(ConfigError::InvalidOptions {
                    device: id.clone(),
                    reason: "empty host".to_string(),
                });
            }
            let port = port.unwrap_or_else(|| config.kind.default_port());
            let driver = TcpDriver::<A::Command, A::State>::new(TcpSettings::new(host, port));
            Arc::new(DeviceHandle::with_tolerance(id.clone(), adapter, driver, tolerance))
        }
        ConnectionConfig::Virtual => {
            let driver = LoopbackDriver::<A::Command, A::State>::new();
            Arc::new(DeviceHandle::with_tolerance(id.clone(), adapter, driver, tolerance))
        }
    };
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cueline::ConductorConfig;

    #[test]
    fn builds_configured_devices() {
        let json = r#"{
            "settings": { "lookahead": 3000 },
            "devices": {
                "ccg": { "kind": "caspar_cg", "connection": { "type": "tcp", "host": "10.0.0.2" } },
                "deck": {
                    "kind": "hyperdeck",
                    "connection": { "type": "virtual" },
                    "options": { "notify": { "transport": true } }
                },
                "hub": { "kind": "router", "connection": { "type": "virtual" }, "options": { "safe_source": 12 } }
            }
        }"#;
        let config = ConductorConfig::from_json_str(json).unwrap();
        let factories = default_factories();
        for (id, device_config) in &config.devices {
            let device = factories.build(id, device_config, &config.settings).unwrap();
            assert_eq!(device.kind(), device_config.kind);
            assert_eq!(device.id(), id);
        }
    }

    #[test]
    fn bad_options_are_a_config_error() {
        let config = DeviceConfig::virtual_device(DeviceKind::Router)
            .with_options(serde_json::json!({ "safe_source": "not a number" }));
        let result = default_factories().build(
            &DeviceId::new("hub"),
            &config,
            &ConductorSettings::default(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidOptions { .. })));
    }
}
