#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    clippy::unwrap_used
)]
#![allow(clippy::type_complexity)]

/*!
Drive playout devices from a declarative timeline.

A [`Conductor`] holds a [`Timeline`] (what should be on air, and when), a
[`Mapping`] (which layer lands on which device) and a set of devices. On every
resolve cycle it asks a [`Resolver`] for the states inside the lookahead
window, lets each device's [`DeviceAdapter`] turn consecutive states into the
minimal list of commands, and stores those commands in the device's
time-ordered queue. Independent dispatch loops then hand due commands to each
device's [`DeviceDriver`].

Replanning is idempotent: every cycle replaces whatever is queued from `now`
on, so changing the timeline or the mapping never leaves stale commands behind.

## Example
```rust,no_run
use std::sync::Arc;
use cueline::{Conductor, ConductorSettings, IntervalResolver, SystemClock};

# async fn run() {
let conductor = Conductor::new(
    ConductorSettings::default(),
    Arc::new(IntervalResolver::new()),
    Arc::new(SystemClock::new()),
);
// register devices with `add_device` or `add_devices_from_config`
let report = conductor.init().await;
for (device, reason) in report.failed() {
    eprintln!("{device} did not connect: {reason}");
}
conductor.start();
# }
```
*/

/// Time sources
pub mod clock;
/// The conductor and its resolve cycle
pub mod conductor;
/// Adapter and driver contracts, and the device handle joining them
pub mod device;
/// Events published by the conductor
pub mod events;
/// Device constructors keyed by kind
pub mod registry;
/// The resolver contract and a resolver for absolute timing
pub mod resolver;
/// Repeating and one-shot timers
pub mod runtime;
/// Per-device command queue
pub mod scheduler;

pub use async_channel;
pub use async_trait::async_trait;
pub use cueline_common::*;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conductor::{Conductor, CycleReport, InitReport, InitStatus};
pub use device::{
    DeviceAdapter, DeviceDriver, DeviceEvent, DeviceEventKind, DeviceEventSender, DeviceHandle,
    DispatchOutcome, DispatchReport, ManagedDevice, PlanSummary, QueuedCommand, StateHistory,
};
pub use events::{ConductorEvent, ErrorScope};
pub use registry::{DeviceFactories, DeviceFactory};
pub use resolver::{IntervalResolver, Resolver};
pub use scheduler::{ScheduledEntry, Scheduler, TickReport};
