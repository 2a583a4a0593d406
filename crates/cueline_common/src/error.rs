//! Error types shared across the cueline crates.

use thiserror::Error;

use crate::{DeviceId, DeviceKind, Time};

/// Errors detected while setting up devices or mappings.
///
/// The offending device or layer is excluded; the rest of the system keeps running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No factory registered for device kind {kind} (device {device})")]
    UnsupportedKind { device: DeviceId, kind: DeviceKind },

    #[error("Device {0} is already registered")]
    DuplicateDevice(DeviceId),

    #[error("Invalid options for device {device}: {reason}")]
    InvalidOptions { device: DeviceId, reason: String },

    #[error("Layer {layer} maps to {device} ({actual}) with a {expected} placement")]
    PlacementMismatch {
        layer: String,
        device: DeviceId,
        expected: DeviceKind,
        actual: DeviceKind,
    },

    #[error("Could not parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolver failures for a window or an instant.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid window [{from}, {to})")]
    InvalidWindow { from: Time, to: Time },

    #[error("Object {object} could not be resolved: {reason}")]
    Object { object: String, reason: String },

    #[error("Resolver failure: {0}")]
    Other(String),
}

/// An adapter could not project or diff a state.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Layer {layer} carries {content} content, which a {kind} device cannot play")]
    UnsupportedContent {
        layer: String,
        content: &'static str,
        kind: DeviceKind,
    },

    #[error("Layer {layer} has a {kind} placement the adapter does not understand")]
    UnsupportedPlacement { layer: String, kind: DeviceKind },

    #[error("Route on layer {layer} has no source: {reason}")]
    UnresolvedRoute { layer: String, reason: String },

    #[error("Planning failed: {0}")]
    Other(String),
}

/// Error type for device driver operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Device is not connected
    #[error("Device not connected")]
    NotConnected,

    /// Communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// Invalid command for this device
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Device-specific error
    #[error("Device error: {0}")]
    Device(String),

    /// Command send failed (channel closed, etc.)
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
