//! The conductor: owns the timeline, the mapping and the device set, and runs
//! the resolve → diff → schedule cycle.
//!
//! # Cycle
//!
//! At `now`, with `horizon = now + lookahead`:
//!
//! 1. Resolve the window `[now, horizon)` and pick `now` plus up to
//!    `max_events` change instants inside it.
//! 2. Take the full state at each instant.
//! 3. For every connected device, project each state, diff consecutive
//!    projections starting from the device's baseline, and replace the
//!    device's queue from `now` on with the result.
//!
//! A resolver failure aborts the whole cycle without touching any device. A
//! planning failure on one device leaves that device unchanged and does not
//! affect the others.
//!
//! Dispatching runs independently: each device has its own loop taking due
//! entries from its queue and handing them to its driver.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_channel::{Receiver, Sender, unbounded};
use cueline_common::error::{ConfigError, DeviceError, ResolveError};
use cueline_common::{
    ConductorConfig, ConductorSettings, ConnectionStatus, DeviceId, Mapping, ResolvedState, Time,
    Timeline,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::device::{
    DeviceEvent, DeviceEventKind, DeviceEventSender, DispatchReport, ManagedDevice, PlanSummary,
};
use crate::events::{ConductorEvent, ErrorScope};
use crate::registry::DeviceFactories;
use crate::resolver::Resolver;
use crate::runtime::{self, TaskHandle};

struct AsyncChannel<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> AsyncChannel<T> {
    fn new() -> Self {
        let (sender, receiver) = unbounded();

        Self { sender, receiver }
    }
}

/// Outcome of connecting one device during [`Conductor::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitStatus {
    /// The driver connected.
    Connected,
    /// The driver failed to connect; the device stays registered.
    Failed(String),
}

/// Per-device outcome of [`Conductor::init`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    /// Status of every registered device.
    pub devices: BTreeMap<DeviceId, InitStatus>,
}

impl InitReport {
    /// Devices whose connection attempt failed.
    pub fn failed(&self) -> impl Iterator<Item = (&DeviceId, &str)> {
        self.devices.iter().filter_map(|(id, status)| match status {
            InitStatus::Failed(reason) => Some((id, reason.as_str())),
            InitStatus::Connected => None,
        })
    }
}

/// Outcome of one resolve cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// The `now` the cycle planned from.
    pub time: Time,
    /// Number of resolved states evaluated.
    pub states: usize,
    /// Devices that were planned.
    pub planned: BTreeMap<DeviceId, PlanSummary>,
    /// Devices skipped because they are not connected.
    pub skipped: Vec<DeviceId>,
    /// Devices whose planning failed, with the rendered error.
    pub failed: BTreeMap<DeviceId, String>,
    /// Set when the resolver failed and nothing was planned.
    pub resolver_error: Option<String>,
}

impl CycleReport {
    fn new(time: Time) -> Self {
        Self {
            time,
            ..Default::default()
        }
    }

    /// Number of commands enqueued for `device` in this cycle.
    pub fn commands_for(&self, device: &str) -> usize {
        self.planned.get(device).map_or(0, |s| s.commands)
    }

    /// True when neither the resolver nor any device failed.
    pub fn is_ok(&self) -> bool {
        self.resolver_error.is_none() && self.failed.is_empty()
    }
}

struct Inner {
    settings: ConductorSettings,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn Resolver>,
    timeline: RwLock<Arc<Timeline>>,
    mapping: RwLock<Arc<Mapping>>,
    devices: DashMap<DeviceId, Arc<dyn ManagedDevice>>,
    /// Serializes resolve cycles.
    cycle: Mutex<()>,
    events: broadcast::Sender<ConductorEvent>,
    device_events: AsyncChannel<DeviceEvent>,
    tasks: Mutex<Vec<TaskHandle>>,
}

/// Drives a set of devices from a timeline.
pub struct Conductor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Conductor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conductor")
            .field("devices", &self.device_ids())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Conductor {
    /// Create a conductor with no devices, an empty timeline and an empty mapping.
    pub fn new(
        settings: ConductorSettings,
        resolver: Arc<dyn Resolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                settings,
                clock,
                resolver,
                timeline: RwLock::new(Arc::new(Vec::new())),
                mapping: RwLock::new(Arc::new(Mapping::new())),
                devices: DashMap::new(),
                cycle: Mutex::new(()),
                events,
                device_events: AsyncChannel::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a conductor from `config`, building its devices with `factories`.
    ///
    /// Devices that cannot be built are reported and left out; the rest are registered.
    pub fn from_config(
        config: &ConductorConfig,
        factories: &DeviceFactories,
        resolver: Arc<dyn Resolver>,
        clock: Arc<dyn Clock>,
    ) -> (Self, Vec<ConfigError>) {
        let conductor = Self::new(config.settings.clone(), resolver, clock);
        let errors = conductor.add_devices_from_config(config, factories);
        (conductor, errors)
    }

    /// The settings the conductor runs with.
    pub fn settings(&self) -> &ConductorSettings {
        &self.inner.settings
    }

    /// Register a device. Ids must be unique.
    pub fn add_device(&self, device: Arc<dyn ManagedDevice>) -> Result<(), ConfigError> {
        let id = device.id().clone();
        match self.inner.devices.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ConfigError::DuplicateDevice(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!("Registered device {} ({})", id, device.kind());
                slot.insert(device);
                Ok(())
            }
        }
    }

    /// Build and register every device in `config`. Failures are reported as
    /// [`ConductorEvent::Error`] and returned; they do not stop the others.
    pub fn add_devices_from_config(
        &self,
        config: &ConductorConfig,
        factories: &DeviceFactories,
    ) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for (id, device_config) in &config.devices {
            let result = factories
                .build(id, device_config, &config.settings)
                .and_then(|device| self.add_device(device));
            if let Err(e) = result {
                error!("Could not add device {}: {}", id, e);
                self.inner
                    .emit(ConductorEvent::error(ErrorScope::Config, &e));
                errors.push(e);
            }
        }
        errors
    }

    /// Connect every registered device concurrently and report per-device outcomes.
    ///
    /// Devices that fail to connect stay registered and are skipped by planning
    /// until their driver reports a connection.
    pub async fn init(&self) -> InitReport {
        let mut set = JoinSet::new();
        for device in self.devices() {
            let sender =
                DeviceEventSender::new(device.id().clone(), self.inner.device_events.sender.clone());
            set.spawn(async move {
                let result = device.connect(sender).await;
                (device.id().clone(), result)
            });
        }

        let mut report = InitReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    info!("Device {} connected", id);
                    report.devices.insert(id, InitStatus::Connected);
                }
                Ok((id, Err(e))) => {
                    warn!("Device {} failed to connect: {}", id, e);
                    self.inner
                        .emit(ConductorEvent::error(ErrorScope::Device(id.clone()), &e));
                    report.devices.insert(id, InitStatus::Failed(e.to_string()));
                }
                Err(e) => {
                    error!("Device connect task failed: {}", e);
                }
            }
        }
        report
    }

    /// Start the resolve loop, the device event loop and one dispatch loop per device.
    ///
    /// Calling this twice restarts the loops.
    pub fn start(&self) {
        self.stop();
        let settings = &self.inner.settings;
        let mut tasks = Vec::new();

        let weak = Arc::downgrade(&self.inner);
        tasks.push(runtime::every(period(settings.resolve_interval), move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.resolve_at(inner.clock.now());
                }
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let receiver = self.inner.device_events.receiver.clone();
        tasks.push(runtime::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_device_event(event).await;
            }
        }));

        for device in self.devices() {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            tasks.push(runtime::every(period(settings.dispatch_interval), move || {
                let weak = weak.clone();
                let device = device.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let report = device.dispatch_due(inner.clock.now()).await;
                        inner.publish_dispatch(device.id(), &report);
                    }
                }
            }));
        }

        info!(
            "Conductor started with {} devices (resolve every {} ms, lookahead {} ms)",
            self.inner.devices.len(),
            settings.resolve_interval,
            settings.lookahead
        );
        *self.inner.tasks.lock() = tasks;
    }

    /// Stop every loop started by [`Conductor::start`].
    pub fn stop(&self) {
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks.iter_mut() {
            task.abort();
        }
    }

    /// Stop the loops and terminate every device.
    pub async fn terminate(&self) {
        self.stop();
        for device in self.devices() {
            device.terminate().await;
        }
        info!("Conductor terminated");
    }

    /// Subscribe to conductor events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConductorEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the timeline and run a resolve cycle immediately.
    pub fn set_timeline(&self, timeline: Timeline) -> CycleReport {
        debug!("Timeline replaced ({} objects)", timeline.len());
        *self.inner.timeline.write() = Arc::new(timeline);
        self.resolve_timeline()
    }

    /// Replace the mapping and run a resolve cycle immediately.
    ///
    /// Entries whose placement does not fit the kind of the device they name are
    /// reported as configuration errors and left out.
    pub fn set_mapping(&self, mapping: Mapping) -> CycleReport {
        let mapping = self.inner.validate_mapping(mapping);
        debug!("Mapping replaced ({} layers)", mapping.len());
        *self.inner.mapping.write() = Arc::new(mapping);
        self.resolve_timeline()
    }

    /// The current timeline.
    pub fn timeline(&self) -> Arc<Timeline> {
        self.inner.timeline.read().clone()
    }

    /// The current mapping.
    pub fn mapping(&self) -> Arc<Mapping> {
        self.inner.mapping.read().clone()
    }

    /// The current time according to the conductor's clock.
    pub fn current_time(&self) -> Time {
        self.inner.clock.now()
    }

    /// Run one resolve cycle at the current time.
    pub fn resolve_timeline(&self) -> CycleReport {
        self.inner.resolve_at(self.inner.clock.now())
    }

    /// Run one resolve cycle at `now`.
    pub fn resolve_at(&self, now: Time) -> CycleReport {
        self.inner.resolve_at(now)
    }

    /// Handle every device event waiting in the channel. Returns how many were handled.
    pub async fn process_device_events(&self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inner.device_events.receiver.try_recv() {
            self.inner.handle_device_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Dispatch every due command on every device once, at the current time.
    pub async fn dispatch_due(&self) -> BTreeMap<DeviceId, DispatchReport> {
        let now = self.inner.clock.now();
        let mut reports = BTreeMap::new();
        for device in self.devices() {
            let report = device.dispatch_due(now).await;
            self.inner.publish_dispatch(device.id(), &report);
            reports.insert(device.id().clone(), report);
        }
        reports
    }

    /// Prepare every device for a show, then resolve.
    ///
    /// With `ok_to_destroy`, queued plans are dropped and baselines re-queried
    /// from the devices, so the next cycle rebuilds everything.
    pub async fn make_ready(&self, ok_to_destroy: bool) -> BTreeMap<DeviceId, Result<(), DeviceError>> {
        let now = self.inner.clock.now();
        let mut results = BTreeMap::new();
        for device in self.devices() {
            let result = device.make_ready(ok_to_destroy, now).await;
            if let Err(e) = &result {
                warn!("Device {} could not be made ready: {}", device.id(), e);
                self.inner
                    .emit(ConductorEvent::error(ErrorScope::Device(device.id().clone()), e));
            }
            results.insert(device.id().clone(), result);
        }
        self.resolve_timeline();
        results
    }

    /// Drop every queued command later than `after` on every device.
    pub fn clear_future(&self, after: Time) -> usize {
        self.devices()
            .iter()
            .map(|device| device.clear_after(after))
            .sum()
    }

    /// The registered device `id`.
    pub fn device(&self, id: &str) -> Option<Arc<dyn ManagedDevice>> {
        self.inner.devices.get(id).map(|d| d.value().clone())
    }

    /// Ids of every registered device, sorted.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.inner.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Last known connection status of device `id`.
    pub fn connection_status(&self, id: &str) -> Option<ConnectionStatus> {
        self.inner.devices.get(id).map(|d| d.connection_status())
    }

    fn devices(&self) -> Vec<Arc<dyn ManagedDevice>> {
        self.inner.sorted_devices()
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn emit(&self, event: ConductorEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn sorted_devices(&self) -> Vec<Arc<dyn ManagedDevice>> {
        let mut devices: Vec<_> = self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    fn validate_mapping(&self, mut mapping: Mapping) -> Mapping {
        mapping.retain(|layer, entry| {
            let Some(device) = self.devices.get(&entry.device) else {
                return true;
            };
            let expected = entry.placement.device_kind();
            if device.kind() == expected {
                return true;
            }
            let e = ConfigError::PlacementMismatch {
                layer: layer.clone(),
                device: entry.device.clone(),
                expected,
                actual: device.kind(),
            };
            error!("{}", e);
            self.emit(ConductorEvent::error(ErrorScope::Config, e));
            false
        });
        mapping
    }

    fn evaluate(&self, timeline: &Timeline, now: Time) -> Result<Vec<ResolvedState>, ResolveError> {
        let horizon = now.saturating_add(self.settings.lookahead.max(0));
        let window = self.resolver.window(timeline, now, horizon)?;

        let mut instants = vec![now];
        instants.extend(
            self.resolver
                .next_events(&window, now, self.settings.max_events)
                .into_iter()
                .filter(|t| *t > now && *t < horizon),
        );
        instants.sort_unstable();
        instants.dedup();

        instants
            .into_iter()
            .map(|at| self.resolver.state_at(timeline, at))
            .collect()
    }

    fn resolve_at(&self, now: Time) -> CycleReport {
        let _cycle = self.cycle.lock();
        let timeline = self.timeline.read().clone();
        let mapping = self.mapping.read().clone();
        let mut report = CycleReport::new(now);

        let states = match self.evaluate(&timeline, now) {
            Ok(states) => states,
            Err(e) => {
                error!("Resolving the timeline at {} failed: {}", now, e);
                self.emit(ConductorEvent::error(ErrorScope::Resolver, &e));
                report.resolver_error = Some(e.to_string());
                return report;
            }
        };
        report.states = states.len();

        for state in &states {
            for layer in state.layers.keys().filter(|l| !mapping.contains_key(*l)) {
                trace!("Layer {} at {} is not mapped to any device", layer, state.time);
            }
        }

        for device in self.sorted_devices() {
            let id = device.id().clone();
            if !device.connection_status().is_connected() {
                trace!("Skipping disconnected device {}", id);
                report.skipped.push(id);
                continue;
            }
            match device.plan(&states, &mapping, now) {
                Ok(summary) => {
                    report.planned.insert(id, summary);
                }
                Err(e) => {
                    warn!("Planning device {} at {} failed: {}", id, now, e);
                    self.emit(ConductorEvent::error(ErrorScope::Device(id.clone()), &e));
                    report.failed.insert(id, e.to_string());
                }
            }
        }

        debug!(
            "Resolved at {}: {} states, {} devices planned, {} skipped, {} failed",
            now,
            report.states,
            report.planned.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    async fn handle_device_event(&self, event: DeviceEvent) {
        let DeviceEvent { device: id, kind } = event;
        match kind {
            DeviceEventKind::ConnectionChanged(status) => {
                info!("Device {} is now {:?}", id, status);
                self.emit(ConductorEvent::ConnectionChanged {
                    device: id.clone(),
                    connected: status.is_connected(),
                });

                let Some(device) = self.devices.get(&id).map(|d| d.value().clone()) else {
                    warn!("Connection event for unknown device {}", id);
                    return;
                };
                match status {
                    ConnectionStatus::Connected => {
                        if let Err(e) = device.resync_baseline().await {
                            warn!("Could not query state of {}: {}", id, e);
                            self.emit(ConductorEvent::error(ErrorScope::Device(id.clone()), &e));
                        }
                        self.resolve_at(self.clock.now());
                    }
                    ConnectionStatus::Disconnected => {
                        let dropped = device.clear_queue();
                        device.reset_baseline();
                        debug!("Dropped {} queued commands of {}", dropped, id);
                    }
                }
            }
            DeviceEventKind::Error(detail) => {
                warn!("Device {} reported: {}", id, detail);
                self.emit(ConductorEvent::Error {
                    scope: ErrorScope::Device(id),
                    detail,
                });
            }
            DeviceEventKind::Info(message) => {
                debug!("Device {}: {}", id, message);
                self.emit(ConductorEvent::Info(format!("{id}: {message}")));
            }
        }
    }

    fn publish_dispatch(&self, device: &DeviceId, report: &DispatchReport) {
        for outcome in &report.outcomes {
            let event = match &outcome.error {
                None => ConductorEvent::CommandExecuted {
                    device: device.clone(),
                    time: outcome.time,
                    context: outcome.context.clone(),
                },
                Some(detail) => ConductorEvent::Error {
                    scope: ErrorScope::Command(device.clone()),
                    detail: format!("{}: {}", outcome.context, detail),
                },
            };
            self.emit(event);
        }
    }
}

fn period(ms: i64) -> std::time::Duration {
    std::time::Duration::from_millis(ms.max(1).unsigned_abs())
}
