//! Resolved timeline state: the concrete content on each layer at an instant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Content, Duration, Time, Transitions};

/// Timestamped snapshot of every active layer. Read-only once produced.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResolvedState {
    pub time: Time,
    pub layers: BTreeMap<String, ResolvedLayer>,
}

impl ResolvedState {
    pub fn empty(time: Time) -> Self {
        Self {
            time,
            layers: BTreeMap::new(),
        }
    }

    pub fn layer(&self, name: &str) -> Option<&ResolvedLayer> {
        self.layers.get(name)
    }

    /// True when both states carry the same layers and content, whatever their times.
    pub fn same_layers(&self, other: &ResolvedState) -> bool {
        self.layers == other.layers
    }
}

/// The object resolved onto one layer, with its computed timing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResolvedLayer {
    pub object_id: String,
    pub layer: String,
    pub content: Content,
    #[serde(default)]
    pub transitions: Option<Transitions>,
    /// Absolute start of the object.
    pub start: Time,
    /// Length of the object when bounded.
    pub duration: Option<Duration>,
}

impl ResolvedLayer {
    pub fn end(&self) -> Option<Time> {
        self.duration.map(|d| self.start + d)
    }
}
