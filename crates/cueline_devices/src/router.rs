//! Video router adapter (Videohub-style crosspoints).

use std::collections::BTreeMap;

use cueline::error::PlanError;
use cueline::{
    CommandContext, CommandWithContext, Content, DeviceAdapter, DeviceId, DeviceKind, Mapping,
    Placement, ResolvedState, layers_for,
};
use serde::{Deserialize, Serialize};

use crate::tcp::WireCommand;

/// Source routed to one output, and who asked for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crosspoint {
    /// Router input.
    pub source: u32,
    /// Logical layer that set the crosspoint.
    pub layer: String,
    /// Timeline object that set the crosspoint.
    pub object_id: String,
}

/// Routed outputs. Outputs not listed carry the safe source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterState {
    /// Crosspoints by output.
    pub outputs: BTreeMap<u32, Crosspoint>,
}

/// Router command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterCommand {
    /// Route `source` to `output`.
    Take {
        /// Router output.
        output: u32,
        /// Router input.
        source: u32,
    },
}

impl WireCommand for RouterCommand {
    // Blocks end with an empty line.
    const LINE_ENDING: &'static str = "\n\n";

    fn to_wire(&self) -> String {
        match self {
            RouterCommand::Take { output, source } => {
                format!("VIDEO OUTPUT ROUTING:\n{output} {source}")
            }
        }
    }

    fn is_error_reply(line: &str) -> bool {
        line == "NAK"
    }
}

/// Options of a router device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RouterOptions {
    /// Input routed to outputs nobody claims.
    pub safe_source: u32,
}

/// Plans crosspoints for a video router.
#[derive(Clone, Debug, Default)]
pub struct RouterAdapter {
    options: RouterOptions,
}

impl RouterAdapter {
    /// Create an adapter with `options`.
    pub fn new(options: RouterOptions) -> Self {
        Self { options }
    }
}

impl DeviceAdapter for RouterAdapter {
    type State = RouterState;
    type Command = RouterCommand;

    fn kind(&self) -> DeviceKind {
        DeviceKind::Router
    }

    fn to_abstract_state(
        &self,
        state: &ResolvedState,
        mapping: &Mapping,
        device: &DeviceId,
    ) -> Result<RouterState, PlanError> {
        let mut router = RouterState::default();
        for (name, layer_mapping) in layers_for(mapping, device) {
            let Some(resolved) = state.layer(name) else {
                continue;
            };
            let Placement::Router { output } = layer_mapping.placement else {
                return Err(PlanError::UnsupportedPlacement {
                    layer: name.clone(),
                    kind: DeviceKind::Router,
                });
            };
            let Content::Crosspoint { source } = resolved.content else {
                return Err(PlanError::UnsupportedContent {
                    layer: name.clone(),
                    content: resolved.content.kind_name(),
                    kind: DeviceKind::Router,
                });
            };
            router.outputs.insert(
                output,
                Crosspoint {
                    source,
                    layer: name.clone(),
                    object_id: resolved.object_id.clone(),
                },
            );
        }
        Ok(router)
    }

    fn diff(&self, old: &RouterState, new: &RouterState) -> Vec<CommandWithContext<RouterCommand>> {
        let mut commands = Vec::new();
        for (output, next) in &new.outputs {
            if old.outputs.get(output).map(|c| c.source) != Some(next.source) {
                commands.push(CommandWithContext::new(
                    RouterCommand::Take {
                        output: *output,
                        source: next.source,
                    },
                    CommandContext::new("take")
                        .for_layer(&next.layer)
                        .for_object(&next.object_id),
                ));
            }
        }
        for (output, previous) in &old.outputs {
            if !new.outputs.contains_key(output) && previous.source != self.options.safe_source {
                commands.push(CommandWithContext::new(
                    RouterCommand::Take {
                        output: *output,
                        source: self.options.safe_source,
                    },
                    CommandContext::new("released").for_layer(&previous.layer),
                ));
            }
        }
        commands
    }

    fn default_state(&self) -> RouterState {
        RouterState::default()
    }
}
