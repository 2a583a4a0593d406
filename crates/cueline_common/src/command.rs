//! Command envelopes shared between adapters, schedulers and drivers.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::{DeviceId, Time};

/// Diagnostic context carried with every command, for correlation in logs and events.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandContext {
    /// Timeline object that caused the command, if any.
    pub object_id: Option<String>,
    /// Logical layer the command belongs to, if any.
    pub layer: Option<String>,
    /// Why the command was planned.
    pub reason: String,
}

impl CommandContext {
    /// Context with only a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            object_id: None,
            layer: None,
            reason: reason.into(),
        }
    }

    /// Attach the logical layer.
    pub fn for_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// Attach the timeline object.
    pub fn for_object(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }
}

impl Display for CommandContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)?;
        if let Some(layer) = &self.layer {
            write!(f, " [layer {layer}]")?;
        }
        if let Some(object) = &self.object_id {
            write!(f, " [object {object}]")?;
        }
        Ok(())
    }
}

/// A device-specific command as produced by a diff, before it is given a time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CommandWithContext<C> {
    pub command: C,
    pub context: CommandContext,
}

impl<C> CommandWithContext<C> {
    /// Pair `command` with its context.
    pub fn new(command: C, context: CommandContext) -> Self {
        Self { command, context }
    }
}

/// A command bound to a target device and an exact execution time.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceCommand<C> {
    pub device: DeviceId,
    pub time: Time,
    pub command: C,
    pub context: CommandContext,
}
