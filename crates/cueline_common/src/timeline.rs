//! Timeline objects: what should play, where, and when.

use serde::{Deserialize, Serialize};

use crate::{Duration, Time};

/// The show's script. Replaced wholesale, never patched in place.
pub type Timeline = Vec<TimelineObject>;

/// A single entry on the schedule.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimelineObject {
    pub id: String,
    pub enable: Enable,
    /// Logical layer this object plays on.
    pub layer: String,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transitions: Option<Transitions>,
    /// Breaks ties between objects starting at the same instant on the same layer.
    #[serde(default)]
    pub priority: i32,
}

impl TimelineObject {
    /// Object active from `start` for `duration` (or forever when `None`).
    pub fn new(
        id: impl Into<String>,
        layer: impl Into<String>,
        start: Time,
        duration: Option<Duration>,
        content: Content,
    ) -> Self {
        Self {
            id: id.into(),
            enable: Enable::Absolute { start, duration },
            layer: layer.into(),
            content,
            transitions: None,
            priority: 0,
        }
    }

    pub fn with_transitions(mut self, transitions: Transitions) -> Self {
        self.transitions = Some(transitions);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// When an object is active.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Enable {
    /// Active on `[start, start + duration)`; open-ended without a duration.
    Absolute {
        start: Time,
        #[serde(default)]
        duration: Option<Duration>,
    },
    /// A relative/conditional expression, only understood by an external resolver.
    Expression(String),
}

/// Content payload, typed by kind.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Media file clip.
    Video {
        file: String,
        #[serde(default)]
        looping: bool,
        /// Frames to skip from the start of the clip.
        #[serde(default)]
        seek: Option<u32>,
    },
    /// Network stream.
    Ip { uri: String },
    /// Live input (e.g. a decklink card).
    Input {
        device: u32,
        #[serde(default)]
        format: Option<String>,
    },
    /// Graphics template.
    Template {
        name: String,
        #[serde(default = "default_template_type")]
        template_type: String,
        #[serde(default)]
        data: Option<String>,
        /// Leave the layer with a template stop instead of clearing it.
        #[serde(default)]
        use_stop_command: bool,
    },
    /// Route another channel/layer onto this one.
    Route {
        /// Logical layer to follow; when mapped, overrides `channel`/`layer`.
        #[serde(default)]
        source_layer: Option<String>,
        #[serde(default)]
        channel: Option<u32>,
        #[serde(default)]
        layer: Option<u32>,
    },
    /// Record the channel output to a file.
    Record {
        file: String,
        #[serde(default)]
        encoder_options: String,
    },
    /// Deck transport.
    Transport {
        status: TransportStatus,
        #[serde(default)]
        record_filename: Option<String>,
    },
    /// Router crosspoint: feed `source` to the mapped output.
    Crosspoint { source: u32 },
}

fn default_template_type() -> String {
    "html".to_string()
}

impl Content {
    /// Short name of the content kind, used in logs and error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Content::Video { .. } => "video",
            Content::Ip { .. } => "ip",
            Content::Input { .. } => "input",
            Content::Template { .. } => "template",
            Content::Route { .. } => "route",
            Content::Record { .. } => "record",
            Content::Transport { .. } => "transport",
            Content::Crosspoint { .. } => "crosspoint",
        }
    }
}

/// Deck transport status.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    #[default]
    Preview,
    Stopped,
    Play,
    Record,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Transitions {
    #[serde(default)]
    pub in_transition: Option<Transition>,
    #[serde(default)]
    pub out_transition: Option<Transition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Transition {
    pub kind: TransitionKind,
    /// Length in frames.
    pub duration: u32,
    #[serde(default = "default_easing")]
    pub easing: String,
    #[serde(default)]
    pub direction: TransitionDirection,
}

fn default_easing() -> String {
    "linear".to_string()
}

impl Transition {
    pub fn new(kind: TransitionKind, duration: u32) -> Self {
        Self {
            kind,
            duration,
            easing: default_easing(),
            direction: TransitionDirection::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Cut,
    Mix,
    Push,
    Wipe,
    Slide,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    Left,
    #[default]
    Right,
}
