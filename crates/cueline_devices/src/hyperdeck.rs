//! Recorder deck adapter (HyperDeck-style transport and notification control).

use cueline::error::PlanError;
use cueline::{
    CommandContext, CommandWithContext, Content, DeviceAdapter, DeviceId, DeviceKind, Mapping,
    Placement, ResolvedState, TransportStatus, layers_for,
};
use serde::{Deserialize, Serialize};

use crate::tcp::WireCommand;

/// Asynchronous notifications the deck should send.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyState {
    /// Remote control changes.
    pub remote: bool,
    /// Transport changes.
    pub transport: bool,
    /// Slot changes.
    pub slot: bool,
    /// Configuration changes.
    pub configuration: bool,
    /// Dropped frames.
    pub dropped_frames: bool,
}

/// What the deck transport should be doing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportState {
    /// Transport status.
    pub status: TransportStatus,
    /// Clip name to record to. `None` when unknown or not recording.
    pub record_filename: Option<String>,
}

/// Everything the deck should be doing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeckState {
    /// Notification toggles.
    pub notify: NotifyState,
    /// Transport.
    pub transport: TransportState,
    /// Layer and object that set the transport, for command contexts.
    pub origin: Option<(String, String)>,
}

/// Notification toggles that changed; unchanged ones are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NotifyChange {
    /// Remote control changes.
    pub remote: Option<bool>,
    /// Transport changes.
    pub transport: Option<bool>,
    /// Slot changes.
    pub slot: Option<bool>,
    /// Configuration changes.
    pub configuration: Option<bool>,
    /// Dropped frames.
    pub dropped_frames: Option<bool>,
}

impl NotifyChange {
    fn between(old: &NotifyState, new: &NotifyState) -> Option<Self> {
        let changed = |a: bool, b: bool| (a != b).then_some(b);
        let change = Self {
            remote: changed(old.remote, new.remote),
            transport: changed(old.transport, new.transport),
            slot: changed(old.slot, new.slot),
            configuration: changed(old.configuration, new.configuration),
            dropped_frames: changed(old.dropped_frames, new.dropped_frames),
        };
        (change != Self::default()).then_some(change)
    }
}

/// Deck command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeckCommand {
    /// Set the changed notification toggles.
    NotifySet(NotifyChange),
    /// Start recording, optionally to a named clip.
    Record {
        /// Clip name.
        filename: Option<String>,
    },
    /// Start playback.
    Play,
    /// Stop the transport.
    Stop,
}

impl WireCommand for DeckCommand {
    const LINE_ENDING: &'static str = "\n";

    fn to_wire(&self) -> String {
        match self {
            DeckCommand::NotifySet(change) => {
                let mut line = String::from("notify:");
                let fields = [
                    ("remote", change.remote),
                    ("transport", change.transport),
                    ("slot", change.slot),
                    ("configuration", change.configuration),
                    ("dropped frames", change.dropped_frames),
                ];
                for (name, value) in fields {
                    if let Some(value) = value {
                        line.push_str(&format!(" {name}: {value}"));
                    }
                }
                line
            }
            DeckCommand::Record { filename: Some(name) } => format!("record: name: {name}"),
            DeckCommand::Record { filename: None } => "record".to_string(),
            DeckCommand::Play => "play".to_string(),
            DeckCommand::Stop => "stop".to_string(),
        }
    }

    fn is_error_reply(line: &str) -> bool {
        line.starts_with('1')
    }
}

/// Options of a deck device.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeckOptions {
    /// Notifications to enable on the deck.
    pub notify: NotifyState,
}

/// Plans transport and notifications for a recorder deck.
#[derive(Clone, Debug, Default)]
pub struct DeckAdapter {
    options: DeckOptions,
}

impl DeckAdapter {
    /// Create an adapter with `options`.
    pub fn new(options: DeckOptions) -> Self {
        Self { options }
    }

    fn context(&self, reason: &str, state: &DeckState) -> CommandContext {
        let context = CommandContext::new(reason);
        match &state.origin {
            Some((layer, object)) => context.for_layer(layer).for_object(object),
            None => context,
        }
    }
}

impl DeviceAdapter for DeckAdapter {
    type State = DeckState;
    type Command = DeckCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Hyperdeck
    }

    fn to_abstract_state(
        &self,
        state: &ResolvedState,
        mapping: &Mapping,
        device: &DeviceId,
    ) -> Result<DeckState, PlanError> {
        let mut deck = DeckState {
            notify: self.options.notify,
            ..Default::default()
        };

        // Layers in name order; later layers override the status and, when
        // they name one, the record filename.
        for (name, layer_mapping) in layers_for(mapping, device) {
            let Some(resolved) = state.layer(name) else {
                continue;
            };
            if layer_mapping.placement != Placement::HyperdeckTransport {
                return Err(PlanError::UnsupportedPlacement {
                    layer: name.clone(),
                    kind: DeviceKind::Hyperdeck,
                });
            }
            let Content::Transport {
                status,
                record_filename,
            } = &resolved.content
            else {
                return Err(PlanError::UnsupportedContent {
                    layer: name.clone(),
                    content: resolved.content.kind_name(),
                    kind: DeviceKind::Hyperdeck,
                });
            };
            deck.transport.status = *status;
            if let Some(filename) = record_filename {
                deck.transport.record_filename = Some(filename.clone());
            }
            deck.origin = Some((name.clone(), resolved.object_id.clone()));
        }
        Ok(deck)
    }

    fn diff(&self, old: &DeckState, new: &DeckState) -> Vec<CommandWithContext<DeckCommand>> {
        let mut commands = Vec::new();

        if let Some(change) = NotifyChange::between(&old.notify, &new.notify) {
            commands.push(CommandWithContext::new(
                DeckCommand::NotifySet(change),
                CommandContext::new("notify changed"),
            ));
        }

        let was = &old.transport;
        let next = &new.transport;
        match next.status {
            TransportStatus::Record => {
                if was.status == TransportStatus::Record {
                    let same_file = was.record_filename.is_none()
                        || was.record_filename == next.record_filename;
                    if !same_file {
                        commands.push(CommandWithContext::new(
                            DeckCommand::Stop,
                            self.context("record file changed", new),
                        ));
                        commands.push(CommandWithContext::new(
                            DeckCommand::Record {
                                filename: next.record_filename.clone(),
                            },
                            self.context("record file changed", new),
                        ));
                    }
                } else {
                    commands.push(CommandWithContext::new(
                        DeckCommand::Record {
                            filename: next.record_filename.clone(),
                        },
                        self.context("record", new),
                    ));
                }
            }
            TransportStatus::Play => {
                if was.status != TransportStatus::Play {
                    if was.status == TransportStatus::Record {
                        commands.push(CommandWithContext::new(
                            DeckCommand::Stop,
                            self.context("leave record", old),
                        ));
                    }
                    commands.push(CommandWithContext::new(
                        DeckCommand::Play,
                        self.context("play", new),
                    ));
                }
            }
            TransportStatus::Preview | TransportStatus::Stopped => {
                if matches!(was.status, TransportStatus::Record | TransportStatus::Play) {
                    commands.push(CommandWithContext::new(
                        DeckCommand::Stop,
                        self.context("stop", old),
                    ));
                }
            }
        }

        commands
    }

    fn default_state(&self) -> DeckState {
        DeckState::default()
    }
}
