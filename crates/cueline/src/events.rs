//! Events the conductor publishes to its subscribers.

use cueline_common::{CommandContext, DeviceId, Time};

/// Where an error originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScope {
    /// Device construction or mapping validation.
    Config,
    /// The timeline resolver; the whole cycle was aborted.
    Resolver,
    /// Planning or connection handling of one device.
    Device(DeviceId),
    /// Execution of one command on one device.
    Command(DeviceId),
}

/// Something observable happened inside the conductor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConductorEvent {
    /// A device connected or disconnected.
    ConnectionChanged {
        /// The device.
        device: DeviceId,
        /// New status.
        connected: bool,
    },
    /// Something failed. Failures never stop the conductor.
    Error {
        /// Origin of the failure.
        scope: ErrorScope,
        /// Rendered error.
        detail: String,
    },
    /// Informational message, usually forwarded from a device.
    Info(String),
    /// A command was executed on a device.
    CommandExecuted {
        /// The device.
        device: DeviceId,
        /// Intended execution time of the command.
        time: Time,
        /// Diagnostic context of the command.
        context: CommandContext,
    },
}

impl ConductorEvent {
    pub(crate) fn error(scope: ErrorScope, detail: impl ToString) -> Self {
        Self::Error {
            scope,
            detail: detail.to_string(),
        }
    }

    /// True for [`ConductorEvent::Error`].
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
