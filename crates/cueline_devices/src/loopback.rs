//! Driver for devices without hardware: commands are logged and kept in memory.

use std::fmt::Debug;

use cueline::error::DeviceError;
use cueline::{CommandContext, ConnectionStatus, DeviceDriver, DeviceEventSender, async_trait};
use parking_lot::Mutex;
use tracing::info;

/// A driver that accepts every command while connected.
///
/// The connection can be toggled by hand to exercise disconnect handling,
/// and a known device state can be installed for the conductor to query.
pub struct LoopbackDriver<C, S> {
    status: Mutex<ConnectionStatus>,
    events: Mutex<Option<DeviceEventSender>>,
    executed: Mutex<Vec<(CommandContext, C)>>,
    known_state: Mutex<Option<S>>,
}

impl<C, S> Default for LoopbackDriver<C, S> {
    fn default() -> Self {
        Self {
            status: Mutex::new(ConnectionStatus::Disconnected),
            events: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            known_state: Mutex::new(None),
        }
    }
}

impl<C, S> Debug for LoopbackDriver<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LoopbackDriver [{:?}, {} executed]",
            *self.status.lock(),
            self.executed.lock().len()
        )
    }
}

impl<C: Clone, S: Clone> LoopbackDriver<C, S> {
    /// Create a disconnected loopback driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands executed so far, oldest first.
    pub fn executed(&self) -> Vec<C> {
        self.executed.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    /// Commands executed so far with their contexts, oldest first.
    pub fn executed_with_context(&self) -> Vec<(CommandContext, C)> {
        self.executed.lock().clone()
    }

    /// Forget every executed command.
    pub fn clear_executed(&self) {
        self.executed.lock().clear();
    }

    /// The state reported by `query_state` from now on.
    pub fn set_known_state(&self, state: Option<S>) {
        *self.known_state.lock() = state;
    }

    /// Simulate the connection going up or down.
    pub fn set_connected(&self, connected: bool) {
        let status = if connected {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        let previous = std::mem::replace(&mut *self.status.lock(), status);
        if previous != status
            && let Some(events) = self.events.lock().as_ref()
        {
            events.connection_changed(status);
        }
    }
}

#[async_trait]
impl<C, S> DeviceDriver for LoopbackDriver<C, S>
where
    C: Clone + Debug + Send + Sync + 'static,
    S: Clone + Send + Sync + 'static,
{
    type Command = C;
    type State = S;

    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError> {
        info!("Virtual device {} connected", events.device());
        *self.events.lock() = Some(events);
        *self.status.lock() = ConnectionStatus::Disconnected;
        self.set_connected(true);
        Ok(())
    }

    async fn execute(&self, command: &C, context: &CommandContext) -> Result<(), DeviceError> {
        if !self.status.lock().is_connected() {
            return Err(DeviceError::NotConnected);
        }
        info!("Virtual command {:?} ({})", command, context);
        self.executed.lock().push((context.clone(), command.clone()));
        Ok(())
    }

    async fn query_state(&self) -> Result<Option<S>, DeviceError> {
        Ok(self.known_state.lock().clone())
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn terminate(&self) {
        *self.status.lock() = ConnectionStatus::Disconnected;
    }
}
