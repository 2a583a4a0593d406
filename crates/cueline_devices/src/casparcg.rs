//! Media server adapter (CasparCG-style channels and layers, AMCP commands).

use std::collections::BTreeMap;

use cueline::error::PlanError;
use cueline::{
    CommandContext, CommandWithContext, Content, DeviceAdapter, DeviceId, DeviceKind, Mapping,
    Placement, ResolvedLayer, ResolvedState, Time, Transition, TransitionDirection, TransitionKind,
    Transitions, layers_for,
};
use serde::{Deserialize, Serialize};

use crate::tcp::WireCommand;

/// What a layer of the media server should be doing.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerContent {
    /// A clip or stream.
    Media {
        /// File name or stream URI.
        clip: String,
        /// Loop the clip.
        looping: bool,
        /// Frames to skip.
        seek: Option<u32>,
    },
    /// A live input card.
    Input {
        /// Card number.
        device: u32,
        /// Video format override.
        format: Option<String>,
    },
    /// A graphics template.
    Template {
        /// Template name.
        name: String,
        /// Template technology (`html`, `flash`).
        template_type: String,
        /// Data handed to the template.
        data: Option<String>,
        /// Leave with a template stop instead of a clear.
        use_stop_command: bool,
    },
    /// Another channel (or one of its layers) routed onto this layer.
    Route {
        /// Source channel.
        channel: u32,
        /// Source layer, or the whole channel.
        layer: Option<u32>,
    },
    /// The channel output recorded to a file.
    Record {
        /// Target file.
        file: String,
        /// Extra encoder options.
        encoder_options: String,
    },
}

/// Where a layer's content came from, for command contexts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerOrigin {
    /// Logical layer name.
    pub layer: String,
    /// Timeline object id.
    pub object_id: String,
}

/// One occupied layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerState {
    /// Where the content came from.
    pub origin: LayerOrigin,
    /// What plays.
    pub content: LayerContent,
    /// Start of the object; a new start replays the layer.
    pub play_time: Time,
    /// Transitions to use when entering or leaving.
    pub transitions: Option<Transitions>,
}

/// Occupied layers of one channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChannelState {
    /// Layers by number.
    pub layers: BTreeMap<u32, LayerState>,
}

/// Everything the media server should be doing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CasparState {
    /// Channels by number.
    pub channels: BTreeMap<u32, ChannelState>,
}

impl CasparState {
    /// The layer at `channel`-`layer`, if occupied.
    pub fn layer(&self, channel: u32, layer: u32) -> Option<&LayerState> {
        self.channels.get(&channel)?.layers.get(&layer)
    }

    fn occupied(&self) -> impl Iterator<Item = ((u32, u32), &LayerState)> {
        self.channels
            .iter()
            .flat_map(|(c, channel)| channel.layers.iter().map(move |(l, s)| ((*c, *l), s)))
    }
}

/// AMCP command.
#[derive(Clone, Debug, PartialEq)]
pub enum CasparCommand {
    /// Play a clip or stream.
    Play {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
        /// Clip name or URI.
        clip: String,
        /// Loop the clip.
        looping: bool,
        /// Frames to skip.
        seek: Option<u32>,
        /// In transition.
        transition: Option<Transition>,
    },
    /// Play a live input.
    PlayDecklink {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
        /// Card number.
        device: u32,
        /// Video format override.
        format: Option<String>,
        /// In transition.
        transition: Option<Transition>,
    },
    /// Route another channel or layer.
    PlayRoute {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
        /// Source channel.
        source_channel: u32,
        /// Source layer.
        source_layer: Option<u32>,
        /// In transition.
        transition: Option<Transition>,
    },
    /// Load and play a template.
    CgAdd {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
        /// Template name.
        template: String,
        /// Template data.
        data: Option<String>,
    },
    /// Stop a template, letting it animate out.
    CgStop {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
    },
    /// Start recording the channel.
    AddFileConsumer {
        /// Channel.
        channel: u32,
        /// Target file.
        file: String,
        /// Extra encoder options.
        encoder_options: String,
    },
    /// Stop recording the channel.
    RemoveFileConsumer {
        /// Channel.
        channel: u32,
        /// Target file.
        file: String,
    },
    /// Play nothing, fading out with a transition.
    PlayEmpty {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
        /// Out transition.
        transition: Transition,
    },
    /// Remove everything from a layer.
    Clear {
        /// Channel.
        channel: u32,
        /// Layer.
        layer: u32,
    },
}

fn transition_wire(transition: &Transition) -> String {
    let kind = match transition.kind {
        TransitionKind::Cut => "CUT",
        TransitionKind::Mix => "MIX",
        TransitionKind::Push => "PUSH",
        TransitionKind::Wipe => "WIPE",
        TransitionKind::Slide => "SLIDE",
    };
    let direction = match transition.direction {
        TransitionDirection::Left => "LEFT",
        TransitionDirection::Right => "RIGHT",
    };
    format!(
        "{} {} {} {}",
        kind,
        transition.duration,
        transition.easing.to_uppercase(),
        direction
    )
}

fn with_transition(mut line: String, transition: &Option<Transition>) -> String {
    if let Some(transition) = transition {
        line.push(' ');
        line.push_str(&transition_wire(transition));
    }
    line
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl WireCommand for CasparCommand {
    fn to_wire(&self) -> String {
        match self {
            CasparCommand::Play {
                channel,
                layer,
                clip,
                looping,
                seek,
                transition,
            } => {
                let mut line = format!("PLAY {}-{} {}", channel, layer, quoted(clip));
                if *looping {
                    line.push_str(" LOOP");
                }
                if let Some(seek) = seek {
                    line.push_str(&format!(" SEEK {seek}"));
                }
                with_transition(line, transition)
            }
            CasparCommand::PlayDecklink {
                channel,
                layer,
                device,
                format,
                transition,
            } => {
                let mut line = format!("PLAY {}-{} DECKLINK {}", channel, layer, device);
                if let Some(format) = format {
                    line.push_str(&format!(" FORMAT {format}"));
                }
                with_transition(line, transition)
            }
            CasparCommand::PlayRoute {
                channel,
                layer,
                source_channel,
                source_layer,
                transition,
            } => {
                let source = match source_layer {
                    Some(l) => format!("route://{source_channel}-{l}"),
                    None => format!("route://{source_channel}"),
                };
                with_transition(format!("PLAY {}-{} {}", channel, layer, source), transition)
            }
            CasparCommand::CgAdd {
                channel,
                layer,
                template,
                data,
            } => {
                let mut line = format!("CG {}-{} ADD 1 {} 1", channel, layer, quoted(template));
                if let Some(data) = data {
                    line.push(' ');
                    line.push_str(&quoted(data));
                }
                line
            }
            CasparCommand::CgStop { channel, layer } => format!("CG {}-{} STOP 1", channel, layer),
            CasparCommand::AddFileConsumer {
                channel,
                file,
                encoder_options,
            } => format!("ADD {} FILE {} {}", channel, quoted(file), encoder_options)
                .trim_end()
                .to_string(),
            CasparCommand::RemoveFileConsumer { channel, file } => {
                format!("REMOVE {} FILE {}", channel, quoted(file))
            }
            CasparCommand::PlayEmpty {
                channel,
                layer,
                transition,
            } => format!(
                "PLAY {}-{} EMPTY {}",
                channel,
                layer,
                transition_wire(transition)
            ),
            CasparCommand::Clear { channel, layer } => format!("CLEAR {}-{}", channel, layer),
        }
    }

    fn is_error_reply(line: &str) -> bool {
        matches!(line.as_bytes().first(), Some(b'4' | b'5'))
    }
}

/// Options of a media server device.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CasparOptions {
    /// Clear layers on removal even when an out transition is set.
    pub ignore_out_transitions: bool,
}

/// Plans channel/layer content for a media server.
#[derive(Clone, Debug, Default)]
pub struct CasparAdapter {
    options: CasparOptions,
}

impl CasparAdapter {
    /// Create an adapter with `options`.
    pub fn new(options: CasparOptions) -> Self {
        Self { options }
    }

    fn layer_content(
        layer_name: &str,
        resolved: &ResolvedLayer,
        mapping: &Mapping,
    ) -> Result<LayerContent, PlanError> {
        let content = match &resolved.content {
            Content::Video {
                file,
                looping,
                seek,
            } => LayerContent::Media {
                clip: file.clone(),
                looping: *looping,
                seek: *seek,
            },
            Content::Ip { uri } => LayerContent::Media {
                clip: uri.clone(),
                looping: false,
                seek: None,
            },
            Content::Input { device, format } => LayerContent::Input {
                device: *device,
                format: format.clone(),
            },
            Content::Template {
                name,
                template_type,
                data,
                use_stop_command,
            } => LayerContent::Template {
                name: name.clone(),
                template_type: template_type.clone(),
                data: data.clone(),
                use_stop_command: *use_stop_command,
            },
            Content::Route {
                source_layer,
                channel,
                layer,
            } => {
                let followed = source_layer
                    .as_ref()
                    .and_then(|name| mapping.get(name))
                    .and_then(|m| match m.placement {
                        Placement::CasparCg { channel, layer } => Some((channel, Some(layer))),
                        _ => None,
                    });
                match followed.or_else(|| channel.map(|c| (c, *layer))) {
                    Some((channel, layer)) => LayerContent::Route { channel, layer },
                    None => {
                        return Err(PlanError::UnresolvedRoute {
                            layer: layer_name.to_string(),
                            reason: match source_layer {
                                Some(name) => format!("layer {name} is not mapped to a channel"),
                                None => "no source layer or channel given".to_string(),
                            },
                        });
                    }
                }
            }
            Content::Record {
                file,
                encoder_options,
            } => LayerContent::Record {
                file: file.clone(),
                encoder_options: encoder_options.clone(),
            },
            other => {
                return Err(PlanError::UnsupportedContent {
                    layer: layer_name.to_string(),
                    content: other.kind_name(),
                    kind: DeviceKind::CasparCg,
                });
            }
        };
        Ok(content)
    }

    fn start(
        &self,
        channel: u32,
        layer: u32,
        state: &LayerState,
    ) -> CasparCommand {
        let transition = state
            .transitions
            .as_ref()
            .and_then(|t| t.in_transition.clone());
        match &state.content {
            LayerContent::Media {
                clip,
                looping,
                seek,
            } => CasparCommand::Play {
                channel,
                layer,
                clip: clip.clone(),
                looping: *looping,
                seek: *seek,
                transition,
            },
            LayerContent::Input { device, format } => CasparCommand::PlayDecklink {
                channel,
                layer,
                device: *device,
                format: format.clone(),
                transition,
            },
            LayerContent::Template { name, data, .. } => CasparCommand::CgAdd {
                channel,
                layer,
                template: name.clone(),
                data: data.clone(),
            },
            LayerContent::Route {
                channel: source_channel,
                layer: source_layer,
            } => CasparCommand::PlayRoute {
                channel,
                layer,
                source_channel: *source_channel,
                source_layer: *source_layer,
                transition,
            },
            LayerContent::Record {
                file,
                encoder_options,
            } => CasparCommand::AddFileConsumer {
                channel,
                file: file.clone(),
                encoder_options: encoder_options.clone(),
            },
        }
    }

    fn stop(&self, channel: u32, layer: u32, state: &LayerState) -> CasparCommand {
        match &state.content {
            LayerContent::Template {
                use_stop_command: true,
                ..
            } => CasparCommand::CgStop { channel, layer },
            LayerContent::Record { file, .. } => CasparCommand::RemoveFileConsumer {
                channel,
                file: file.clone(),
            },
            _ => match state
                .transitions
                .as_ref()
                .and_then(|t| t.out_transition.clone())
            {
                Some(transition) if !self.options.ignore_out_transitions => {
                    CasparCommand::PlayEmpty {
                        channel,
                        layer,
                        transition,
                    }
                }
                _ => CasparCommand::Clear { channel, layer },
            },
        }
    }
}

fn context(reason: &str, state: &LayerState) -> CommandContext {
    CommandContext::new(reason)
        .for_layer(&state.origin.layer)
        .for_object(&state.origin.object_id)
}

impl DeviceAdapter for CasparAdapter {
    type State = CasparState;
    type Command = CasparCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::CasparCg
    }

    fn to_abstract_state(
        &self,
        state: &ResolvedState,
        mapping: &Mapping,
        device: &DeviceId,
    ) -> Result<CasparState, PlanError> {
        let mut caspar = CasparState::default();
        for (name, layer_mapping) in layers_for(mapping, device) {
            let Some(resolved) = state.layer(name) else {
                continue;
            };
            let Placement::CasparCg { channel, layer } = layer_mapping.placement else {
                return Err(PlanError::UnsupportedPlacement {
                    layer: name.clone(),
                    kind: DeviceKind::CasparCg,
                });
            };
            let content = Self::layer_content(name, resolved, mapping)?;
            caspar.channels.entry(channel).or_default().layers.insert(
                layer,
                LayerState {
                    origin: LayerOrigin {
                        layer: name.clone(),
                        object_id: resolved.object_id.clone(),
                    },
                    content,
                    play_time: resolved.start,
                    transitions: resolved.transitions.clone(),
                },
            );
        }
        Ok(caspar)
    }

    fn diff(&self, old: &CasparState, new: &CasparState) -> Vec<CommandWithContext<CasparCommand>> {
        let mut commands = Vec::new();

        for ((channel, layer), next) in new.occupied() {
            match old.layer(channel, layer) {
                Some(previous) if previous == next => {}
                Some(previous) => {
                    // A recording is a channel consumer; playing over the layer does not end it.
                    if matches!(previous.content, LayerContent::Record { .. }) {
                        commands.push(CommandWithContext::new(
                            self.stop(channel, layer, previous),
                            context("replaced", previous),
                        ));
                    }
                    commands.push(CommandWithContext::new(
                        self.start(channel, layer, next),
                        context("changed", next),
                    ));
                }
                None => commands.push(CommandWithContext::new(
                    self.start(channel, layer, next),
                    context("added", next),
                )),
            }
        }

        for ((channel, layer), previous) in old.occupied() {
            if new.layer(channel, layer).is_none() {
                commands.push(CommandWithContext::new(
                    self.stop(channel, layer, previous),
                    context("removed", previous),
                ));
            }
        }

        commands
    }

    fn default_state(&self) -> CasparState {
        CasparState::default()
    }
}
