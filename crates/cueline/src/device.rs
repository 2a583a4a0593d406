//! Device abstraction: adapters plan, drivers execute, handles tie them together.
//!
//! # Architecture
//!
//! - A [`DeviceAdapter`] is pure planning logic for one device kind. It projects
//!   a [`ResolvedState`] onto the device's own state shape and diffs two such
//!   states into commands. It never touches the network.
//! - A [`DeviceDriver`] owns the connection and executes one already-decided
//!   command at a time. It reports connection changes on a one-way
//!   [`DeviceEventSender`] channel instead of holding a reference to the
//!   conductor.
//! - A [`DeviceHandle`] pairs an adapter with a driver, owns the device's
//!   [`Scheduler`] queue and its baseline [`StateHistory`], and exposes the
//!   object-safe [`ManagedDevice`] trait the conductor works with.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use cueline_common::error::{DeviceError, PlanError};
use cueline_common::{
    CommandContext, CommandWithContext, ConnectionStatus, DeviceId, DeviceKind, Mapping,
    ResolvedState, Time,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::scheduler::{DEFAULT_DISPATCH_TOLERANCE, ScheduledEntry, Scheduler};

// ============================================================================
// Contracts
// ============================================================================

/// Planning logic for one device kind.
///
/// Implementations must be side-effect free: no I/O, no interior state that
/// changes the result of later calls.
pub trait DeviceAdapter: Send + Sync + 'static {
    /// Everything the device should currently be doing.
    type State: Clone + PartialEq + Debug + Send + Sync + 'static;
    /// Device-specific instruction.
    type Command: Clone + Debug + Send + Sync + 'static;

    /// The device kind this adapter plans for.
    fn kind(&self) -> DeviceKind;

    /// Project the layers of `state` that `mapping` binds to `device`.
    ///
    /// Layers mapped elsewhere, or not mapped at all, are ignored.
    fn to_abstract_state(
        &self,
        state: &ResolvedState,
        mapping: &Mapping,
        device: &DeviceId,
    ) -> Result<Self::State, PlanError>;

    /// The minimal ordered command list moving the device from `old` to `new`.
    ///
    /// `diff(s, s)` must be empty.
    fn diff(
        &self,
        old: &Self::State,
        new: &Self::State,
    ) -> Vec<CommandWithContext<Self::Command>>;

    /// The safe cold-start assumption used before anything is known about the device.
    fn default_state(&self) -> Self::State;
}

/// Connection and execution for one device.
#[async_trait]
pub trait DeviceDriver: Send + Sync + 'static {
    /// Command type executed by this driver.
    type Command: Send + Sync + 'static;
    /// State type the driver can query from the device.
    type State: Send + 'static;

    /// Establish the connection. Status changes, including this one, are
    /// reported on `events` for as long as the driver lives.
    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError>;

    /// Execute one command against the device.
    async fn execute(
        &self,
        command: &Self::Command,
        context: &CommandContext,
    ) -> Result<(), DeviceError>;

    /// Ask the device what it is actually doing. `None` when the driver cannot tell.
    async fn query_state(&self) -> Result<Option<Self::State>, DeviceError> {
        Ok(None)
    }

    /// The last known connection status.
    fn connection_status(&self) -> ConnectionStatus;

    /// Close the connection and stop background tasks.
    async fn terminate(&self) {}
}

// ============================================================================
// Device events
// ============================================================================

/// A message from a device to whoever drives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// The device the event is about.
    pub device: DeviceId,
    /// What happened.
    pub kind: DeviceEventKind,
}

/// Kinds of [`DeviceEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// The connection went up or down.
    ConnectionChanged(ConnectionStatus),
    /// Something went wrong outside of command execution.
    Error(String),
    /// Informational message.
    Info(String),
}

/// Sending half of the one-way device → conductor channel, bound to one device.
#[derive(Clone, Debug)]
pub struct DeviceEventSender {
    device: DeviceId,
    sender: Option<async_channel::Sender<DeviceEvent>>,
}

impl DeviceEventSender {
    /// Create a sender connected to `sender`.
    pub fn new(device: DeviceId, sender: async_channel::Sender<DeviceEvent>) -> Self {
        Self {
            device,
            sender: Some(sender),
        }
    }

    /// Create a sender that drops every event (for tests or standalone drivers).
    pub fn dummy(device: DeviceId) -> Self {
        Self {
            device,
            sender: None,
        }
    }

    /// The device this sender reports for.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Emit an event (silent if nobody listens).
    pub fn emit(&self, kind: DeviceEventKind) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(DeviceEvent {
                device: self.device.clone(),
                kind,
            });
        }
    }

    /// Report a connection status change.
    pub fn connection_changed(&self, status: ConnectionStatus) {
        self.emit(DeviceEventKind::ConnectionChanged(status));
    }

    /// Report an error.
    pub fn error(&self, message: impl Into<String>) {
        self.emit(DeviceEventKind::Error(message.into()));
    }

    /// Report an informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.emit(DeviceEventKind::Info(message.into()));
    }
}

// ============================================================================
// Baseline history
// ============================================================================

/// Projected device states keyed by the instant they become valid.
///
/// The baseline for a cycle at `now` is the newest state strictly before
/// `now`; states at or after `now` belong to the plan being replaced. When
/// commands were taken early, the plan starts after the newest of them
/// instead, and the state they applied is the baseline.
#[derive(Debug, Clone)]
pub struct StateHistory<S> {
    states: BTreeMap<Time, S>,
}

impl<S> Default for StateHistory<S> {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
        }
    }
}

impl<S> StateHistory<S> {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// The newest state valid strictly before `time`.
    pub fn before(&self, time: Time) -> Option<(Time, &S)> {
        self.states.range(..time).next_back().map(|(t, s)| (*t, s))
    }

    /// The newest state recorded.
    pub fn latest(&self) -> Option<(Time, &S)> {
        self.states.iter().next_back().map(|(t, s)| (*t, s))
    }

    /// Replace everything at or after `from` with `states`, and forget
    /// everything older than the baseline of `from`.
    pub fn commit(&mut self, from: Time, states: impl IntoIterator<Item = (Time, S)>) {
        self.states.split_off(&from);
        if let Some(baseline) = self.states.range(..from).next_back().map(|(t, _)| *t) {
            self.states = self.states.split_off(&baseline);
        }
        self.states.extend(states);
    }

    /// Forget everything; with `known`, it becomes the baseline for any future time.
    pub fn reset(&mut self, known: Option<S>) {
        self.states.clear();
        if let Some(state) = known {
            self.states.insert(Time::MIN, state);
        }
    }

    /// Get the number of recorded states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ============================================================================
// Managed device
// ============================================================================

/// Result of planning one device for one resolve cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Number of resolved states evaluated.
    pub states: usize,
    /// Number of commands enqueued.
    pub commands: usize,
    /// Number of previously scheduled entries discarded.
    pub replaced: usize,
}

/// One command taken from the queue and handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Intended execution time.
    pub time: Time,
    /// Diagnostic context of the command.
    pub context: CommandContext,
    /// The driver error, if execution failed.
    pub error: Option<String>,
}

/// Commands handled by one dispatch pass, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Every command taken from the queue.
    pub outcomes: Vec<DispatchOutcome>,
}

impl DispatchReport {
    /// Number of commands executed successfully.
    pub fn executed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }

    /// Number of commands whose execution failed.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.executed()
    }
}

/// Debug view of a queued command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    /// Intended execution time.
    pub time: Time,
    /// `Debug` rendering of the command.
    pub command: String,
    /// Diagnostic context of the command.
    pub context: CommandContext,
}

/// Object-safe view of a registered device, used by the conductor.
#[async_trait]
pub trait ManagedDevice: Send + Sync + 'static {
    /// Device id.
    fn id(&self) -> &DeviceId;

    /// Device kind.
    fn kind(&self) -> DeviceKind;

    /// Last known connection status.
    fn connection_status(&self) -> ConnectionStatus;

    /// Connect the driver, reporting status changes on `events`.
    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError>;

    /// Diff `states` (ascending, first at `now`) against the baseline and
    /// replace the queued plan from `now` on. Commands already taken for
    /// execution, even early, are never planned again.
    ///
    /// On error nothing changes: queue and baseline stay as they were.
    fn plan(
        &self,
        states: &[ResolvedState],
        mapping: &Mapping,
        now: Time,
    ) -> Result<PlanSummary, PlanError>;

    /// Execute every queued command due at `now`, in time order.
    async fn dispatch_due(&self, now: Time) -> DispatchReport;

    /// Drop queued entries with `time >= cutoff`.
    fn clear_from(&self, cutoff: Time) -> usize;

    /// Drop queued entries with `time > cutoff`.
    fn clear_after(&self, cutoff: Time) -> usize;

    /// Drop every queued entry.
    fn clear_queue(&self) -> usize;

    /// Forget the baseline; the next plan starts from the adapter's default state.
    fn reset_baseline(&self);

    /// Re-query the device and install the answer as baseline, falling back to
    /// the default state when the device cannot tell.
    async fn resync_baseline(&self) -> Result<(), DeviceError>;

    /// Prepare for a show. With `ok_to_destroy`, the plan from `now` on is
    /// dropped and the baseline re-queried.
    async fn make_ready(&self, ok_to_destroy: bool, now: Time) -> Result<(), DeviceError> {
        if ok_to_destroy {
            self.clear_from(now);
            self.resync_baseline().await?;
        }
        Ok(())
    }

    /// Snapshot of the queue, in execution order.
    fn queued(&self) -> Vec<QueuedCommand>;

    /// Stop the driver.
    async fn terminate(&self);
}

/// An adapter and a driver joined into a schedulable device.
pub struct DeviceHandle<A: DeviceAdapter, D> {
    id: DeviceId,
    adapter: A,
    driver: Arc<D>,
    scheduler: Mutex<Scheduler<A::Command>>,
    history: Mutex<StateHistory<A::State>>,
    dispatch_turn: tokio::sync::Mutex<()>,
}

impl<A, D> Debug for DeviceHandle<A, D>
where
    A: DeviceAdapter,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DeviceHandle [{} ({}), {} queued]",
            self.id,
            self.adapter.kind(),
            self.scheduler.lock().len()
        )
    }
}

impl<A, D> DeviceHandle<A, D>
where
    A: DeviceAdapter,
    D: DeviceDriver<Command = A::Command, State = A::State>,
{
    /// Join `adapter` and `driver` under `id`, with the default dispatch tolerance.
    pub fn new(id: impl Into<DeviceId>, adapter: A, driver: D) -> Self {
        Self::with_tolerance(id, adapter, driver, DEFAULT_DISPATCH_TOLERANCE)
    }

    /// Join `adapter` and `driver` under `id`, executing commands up to `tolerance` ms early.
    pub fn with_tolerance(id: impl Into<DeviceId>, adapter: A, driver: D, tolerance: i64) -> Self {
        Self {
            id: id.into(),
            adapter,
            driver: Arc::new(driver),
            scheduler: Mutex::new(Scheduler::new(tolerance)),
            history: Mutex::new(StateHistory::new()),
            dispatch_turn: tokio::sync::Mutex::new(()),
        }
    }

    /// The planning adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// The driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Copy of the queued entries, in execution order.
    pub fn queue(&self) -> Vec<ScheduledEntry<A::Command>> {
        self.scheduler.lock().iter().cloned().collect()
    }

    /// The baseline a plan at `now` would diff against.
    pub fn baseline(&self, now: Time) -> A::State {
        let from = plan_start(self.scheduler.lock().taken_until(), now);
        self.history
            .lock()
            .before(from)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.adapter.default_state())
    }
}

/// First instant a plan at `now` may change.
fn plan_start(taken_until: Option<Time>, now: Time) -> Time {
    match taken_until {
        Some(taken) if taken >= now => taken.saturating_add(1),
        _ => now,
    }
}

#[async_trait]
impl<A, D> ManagedDevice for DeviceHandle<A, D>
where
    A: DeviceAdapter,
    D: DeviceDriver<Command = A::Command, State = A::State>,
{
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn kind(&self) -> DeviceKind {
        self.adapter.kind()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.driver.connection_status()
    }

    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError> {
        info!("Connecting device {} ({})", self.id, self.adapter.kind());
        self.driver.connect(events).await
    }

    fn plan(
        &self,
        states: &[ResolvedState],
        mapping: &Mapping,
        now: Time,
    ) -> Result<PlanSummary, PlanError> {
        let mut history = self.history.lock();
        let mut scheduler = self.scheduler.lock();

        // Entries taken ahead of their time are already applied, so the plan
        // starts right after the newest of them.
        let from = plan_start(scheduler.taken_until(), now);
        let first = states.iter().rposition(|s| s.time <= from).unwrap_or(0);

        let mut previous = history
            .before(from)
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| self.adapter.default_state());

        let mut planned = Vec::new();
        let mut projected = Vec::with_capacity(states.len() - first);
        for state in &states[first..] {
            let at = state.time.max(from);
            let next = self.adapter.to_abstract_state(state, mapping, &self.id)?;
            for CommandWithContext { command, context } in self.adapter.diff(&previous, &next) {
                planned.push((at, command, context));
            }
            projected.push((at, next.clone()));
            previous = next;
        }

        let commands = planned.len();
        let replaced = scheduler.replace_from(from, planned);
        history.commit(from, projected);

        trace!(
            "Planned {} commands for {} from {} states (replaced {})",
            commands,
            self.id,
            states.len(),
            replaced
        );
        Ok(PlanSummary {
            states: states.len(),
            commands,
            replaced,
        })
    }

    async fn dispatch_due(&self, now: Time) -> DispatchReport {
        let _turn = self.dispatch_turn.lock().await;
        let due = self.scheduler.lock().take_due(now);

        let mut report = DispatchReport::default();
        for entry in due {
            let result = self.driver.execute(&entry.command, &entry.context).await;
            let error = match result {
                Ok(()) => {
                    debug!(
                        "{} executed {:?} (due {}, now {}): {}",
                        self.id, entry.command, entry.time, now, entry.context
                    );
                    None
                }
                Err(e) => {
                    warn!(
                        "{} failed to execute {:?} ({}): {}",
                        self.id, entry.command, entry.context, e
                    );
                    Some(e.to_string())
                }
            };
            report.outcomes.push(DispatchOutcome {
                time: entry.time,
                context: entry.context,
                error,
            });
        }
        report
    }

    fn clear_from(&self, cutoff: Time) -> usize {
        self.scheduler.lock().clear_from_now_and_after(cutoff)
    }

    fn clear_after(&self, cutoff: Time) -> usize {
        self.scheduler.lock().clear_after(cutoff)
    }

    fn clear_queue(&self) -> usize {
        let mut scheduler = self.scheduler.lock();
        let removed = scheduler.len();
        scheduler.clear();
        removed
    }

    fn reset_baseline(&self) {
        self.history.lock().reset(None);
    }

    async fn resync_baseline(&self) -> Result<(), DeviceError> {
        match self.driver.query_state().await {
            Ok(known) => {
                debug!(
                    "Baseline of {} reset ({})",
                    self.id,
                    if known.is_some() { "queried" } else { "default" }
                );
                self.history.lock().reset(known);
                Ok(())
            }
            Err(e) => {
                self.history.lock().reset(None);
                Err(e)
            }
        }
    }

    fn queued(&self) -> Vec<QueuedCommand> {
        self.scheduler
            .lock()
            .iter()
            .map(|e| QueuedCommand {
                time: e.time,
                command: format!("{:?}", e.command),
                context: e.context.clone(),
            })
            .collect()
    }

    async fn terminate(&self) {
        self.clear_queue();
        self.driver.terminate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_baseline_is_strictly_before() {
        let mut history = StateHistory::new();
        history.commit(100, vec![(100, "a"), (200, "b")]);
        assert_eq!(history.before(100), None);
        assert_eq!(history.before(101), Some((100, &"a")));
        assert_eq!(history.before(250), Some((200, &"b")));
        assert_eq!(history.latest(), Some((200, &"b")));
    }

    #[test]
    fn history_commit_replaces_future_and_prunes_past() {
        let mut history = StateHistory::new();
        history.commit(0, vec![(0, "a"), (100, "b"), (200, "c")]);
        history.commit(150, vec![(150, "x"), (300, "y")]);

        assert_eq!(history.before(150), Some((100, &"b")));
        assert_eq!(history.before(151), Some((150, &"x")));
        assert_eq!(history.len(), 3);
        assert_eq!(history.before(100), None);
    }

    #[test]
    fn history_reset_with_known_state_covers_all_time() {
        let mut history = StateHistory::new();
        history.commit(0, vec![(0, "a")]);
        history.reset(Some("known"));
        assert_eq!(history.before(0).map(|(_, s)| *s), Some("known"));
        history.reset(None);
        assert!(history.is_empty());
    }

    #[test]
    fn dummy_sender_drops_events() {
        let sender = DeviceEventSender::dummy(DeviceId::new("x"));
        sender.connection_changed(ConnectionStatus::Connected);
        assert_eq!(sender.device().as_str(), "x");
    }

    #[test]
    fn sender_tags_events_with_device() {
        let (tx, rx) = async_channel::unbounded();
        let sender = DeviceEventSender::new(DeviceId::new("deck"), tx);
        sender.error("tape jam");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.device, DeviceId::new("deck"));
        assert_eq!(event.kind, DeviceEventKind::Error("tape jam".into()));
    }
}
