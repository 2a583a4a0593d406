#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use cueline::error::{DeviceError, PlanError};
use cueline::{
    CommandContext, CommandWithContext, Conductor, ConductorSettings, ConnectionStatus, Content,
    DeviceAdapter, DeviceDriver, DeviceEventSender, DeviceHandle, DeviceId, DeviceKind,
    IntervalResolver, LayerMapping, ManualClock, Mapping, ResolvedState, Time, TimelineObject,
    async_trait, layers_for,
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cueline=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

// Layer name -> object id shown on it
pub type TestState = BTreeMap<String, String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestCommand {
    Show { layer: String, object: String },
    Hide { layer: String },
}

// Plans any layer mapped to the device; refuses `Record` content
#[derive(Debug, Default)]
pub struct TestAdapter;

impl DeviceAdapter for TestAdapter {
    type State = TestState;
    type Command = TestCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::CasparCg
    }

    fn to_abstract_state(
        &self,
        state: &ResolvedState,
        mapping: &Mapping,
        device: &DeviceId,
    ) -> Result<TestState, PlanError> {
        let mut projected = TestState::new();
        for (layer, _) in layers_for(mapping, device) {
            let Some(resolved) = state.layer(layer) else {
                continue;
            };
            if let Content::Record { .. } = resolved.content {
                return Err(PlanError::UnsupportedContent {
                    layer: layer.clone(),
                    content: resolved.content.kind_name(),
                    kind: DeviceKind::CasparCg,
                });
            }
            projected.insert(layer.clone(), resolved.object_id.clone());
        }
        Ok(projected)
    }

    fn diff(&self, old: &TestState, new: &TestState) -> Vec<CommandWithContext<TestCommand>> {
        let mut commands = Vec::new();
        for (layer, object) in new {
            if old.get(layer) != Some(object) {
                commands.push(CommandWithContext::new(
                    TestCommand::Show {
                        layer: layer.clone(),
                        object: object.clone(),
                    },
                    CommandContext::new("show").for_layer(layer).for_object(object),
                ));
            }
        }
        for layer in old.keys().filter(|l| !new.contains_key(*l)) {
            commands.push(CommandWithContext::new(
                TestCommand::Hide {
                    layer: layer.clone(),
                },
                CommandContext::new("hide").for_layer(layer),
            ));
        }
        commands
    }

    fn default_state(&self) -> TestState {
        TestState::new()
    }
}

#[derive(Debug, Default)]
pub struct RecordingDriver {
    status: Mutex<ConnectionStatus>,
    events: Mutex<Option<DeviceEventSender>>,
    pub executed: Mutex<Vec<TestCommand>>,
    pub fail_objects: Mutex<Vec<String>>,
    pub refuse_connect: Mutex<bool>,
    pub known_state: Mutex<Option<TestState>>,
}

impl RecordingDriver {
    pub fn executed(&self) -> Vec<TestCommand> {
        self.executed.lock().clone()
    }

    pub fn fail_on(&self, object: &str) {
        self.fail_objects.lock().push(object.to_string());
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
        if let Some(events) = self.events.lock().as_ref() {
            events.connection_changed(status);
        }
    }
}

#[async_trait]
impl DeviceDriver for RecordingDriver {
    type Command = TestCommand;
    type State = TestState;

    async fn connect(&self, events: DeviceEventSender) -> Result<(), DeviceError> {
        if *self.refuse_connect.lock() {
            return Err(DeviceError::Communication("connection refused".into()));
        }
        *self.events.lock() = Some(events);
        self.set_status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn execute(
        &self,
        command: &TestCommand,
        _context: &CommandContext,
    ) -> Result<(), DeviceError> {
        if let TestCommand::Show { object, .. } = command
            && self.fail_objects.lock().contains(object)
        {
            return Err(DeviceError::Device(format!("cannot show {object}")));
        }
        self.executed.lock().push(command.clone());
        Ok(())
    }

    async fn query_state(&self) -> Result<Option<TestState>, DeviceError> {
        Ok(self.known_state.lock().clone())
    }

    fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }
}

pub type TestDevice = DeviceHandle<TestAdapter, RecordingDriver>;

pub fn test_device(id: &str) -> Arc<TestDevice> {
    Arc::new(DeviceHandle::new(id, TestAdapter, RecordingDriver::default()))
}

pub fn conductor(start: Time) -> (Conductor, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start));
    let conductor = Conductor::new(
        ConductorSettings::default(),
        Arc::new(IntervalResolver::new()),
        clock.clone(),
    );
    (conductor, clock)
}

pub fn clip(id: &str, layer: &str, start: Time, duration: Option<Time>) -> TimelineObject {
    TimelineObject::new(
        id,
        layer,
        start,
        duration,
        Content::Video {
            file: id.to_uppercase(),
            looping: false,
            seek: None,
        },
    )
}

pub fn mapping(entries: &[(&str, &str)]) -> Mapping {
    entries
        .iter()
        .enumerate()
        .map(|(i, (layer, device))| {
            (
                layer.to_string(),
                LayerMapping::casparcg(*device, 1, 10 + i as u32),
            )
        })
        .collect()
}

pub fn show(layer: &str, object: &str) -> TestCommand {
    TestCommand::Show {
        layer: layer.into(),
        object: object.into(),
    }
}

pub fn hide(layer: &str) -> TestCommand {
    TestCommand::Hide {
        layer: layer.into(),
    }
}

pub fn queued_times(device: &TestDevice) -> Vec<(Time, TestCommand)> {
    device
        .queue()
        .into_iter()
        .map(|e| (e.time, e.command))
        .collect()
}
