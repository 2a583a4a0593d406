//! The resolver contract and a resolver for absolutely timed objects.
//!
//! The conductor only consumes the [`Resolver`] trait. Resolving relative or
//! conditional timing expressions is the job of an external implementation;
//! [`IntervalResolver`] covers timelines whose objects all carry absolute
//! start times.

use std::collections::{BTreeMap, BTreeSet};

use cueline_common::error::ResolveError;
use cueline_common::{Enable, ResolvedLayer, ResolvedState, Time, Timeline, TimelineObject};
use tracing::debug;

/// Turns a timeline into resolved states. Implementations must be pure:
/// identical inputs always give identical outputs.
pub trait Resolver: Send + Sync + 'static {
    /// All distinct states whose validity intersects `[from, to)`.
    ///
    /// The first state is the one valid at `from`; each following state starts
    /// at a change instant inside the window.
    fn window(
        &self,
        timeline: &Timeline,
        from: Time,
        to: Time,
    ) -> Result<Vec<ResolvedState>, ResolveError>;

    /// Up to `max` strictly increasing instants after `from` at which the
    /// resolved content of any layer changes.
    fn next_events(&self, window: &[ResolvedState], from: Time, max: usize) -> Vec<Time> {
        window
            .iter()
            .map(|s| s.time)
            .filter(|t| *t > from)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(max)
            .collect()
    }

    /// The full per-layer state valid at `at`.
    fn state_at(&self, timeline: &Timeline, at: Time) -> Result<ResolvedState, ResolveError>;
}

/// Resolver for objects with [`Enable::Absolute`] timing.
///
/// An object is active on `[start, start + duration)`, or from `start` on when
/// it has no duration. When several objects are active on one layer, the one
/// that started last wins; ties go to the higher priority, then to the object
/// appearing later in the timeline. Objects with an [`Enable::Expression`] are
/// skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalResolver;

struct Interval<'a> {
    object: &'a TimelineObject,
    index: usize,
    start: Time,
    end: Option<Time>,
}

impl Interval<'_> {
    fn contains(&self, at: Time) -> bool {
        self.start <= at && self.end.is_none_or(|end| at < end)
    }

    fn precedence(&self) -> (Time, i32, usize) {
        (self.start, self.object.priority, self.index)
    }
}

impl IntervalResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    fn intervals(timeline: &Timeline) -> Result<Vec<Interval<'_>>, ResolveError> {
        let mut intervals = Vec::with_capacity(timeline.len());
        for (index, object) in timeline.iter().enumerate() {
            match &object.enable {
                Enable::Absolute { start, duration } => {
                    if let Some(d) = duration
                        && *d < 0
                    {
                        return Err(ResolveError::Object {
                            object: object.id.clone(),
                            reason: format!("negative duration {d}"),
                        });
                    }
                    intervals.push(Interval {
                        object,
                        index,
                        start: *start,
                        end: duration.map(|d| start.saturating_add(d)),
                    });
                }
                Enable::Expression(expr) => {
                    debug!("Skipping object {} with expression timing {:?}", object.id, expr);
                }
            }
        }
        Ok(intervals)
    }

    fn state_from(intervals: &[Interval<'_>], at: Time) -> ResolvedState {
        let mut winners: BTreeMap<&str, &Interval<'_>> = BTreeMap::new();
        for interval in intervals.iter().filter(|i| i.contains(at)) {
            let layer = interval.object.layer.as_str();
            match winners.get(layer) {
                Some(current) if current.precedence() >= interval.precedence() => {}
                _ => {
                    winners.insert(layer, interval);
                }
            }
        }

        let layers = winners
            .into_iter()
            .map(|(layer, interval)| {
                let object = interval.object;
                (
                    layer.to_string(),
                    ResolvedLayer {
                        object_id: object.id.clone(),
                        layer: layer.to_string(),
                        content: object.content.clone(),
                        transitions: object.transitions.clone(),
                        start: interval.start,
                        duration: interval.end.map(|end| end - interval.start),
                    },
                )
            })
            .collect();

        ResolvedState { time: at, layers }
    }
}

impl Resolver for IntervalResolver {
    fn window(
        &self,
        timeline: &Timeline,
        from: Time,
        to: Time,
    ) -> Result<Vec<ResolvedState>, ResolveError> {
        if to < from {
            return Err(ResolveError::InvalidWindow { from, to });
        }
        let intervals = Self::intervals(timeline)?;

        let mut instants = BTreeSet::new();
        instants.insert(from);
        for interval in &intervals {
            for edge in std::iter::once(interval.start).chain(interval.end) {
                if edge > from && edge < to {
                    instants.insert(edge);
                }
            }
        }

        let mut states: Vec<ResolvedState> = Vec::with_capacity(instants.len());
        for at in instants {
            let state = Self::state_from(&intervals, at);
            if states.last().is_some_and(|prev| prev.same_layers(&state)) {
                continue;
            }
            states.push(state);
        }
        Ok(states)
    }

    fn state_at(&self, timeline: &Timeline, at: Time) -> Result<ResolvedState, ResolveError> {
        let intervals = Self::intervals(timeline)?;
        Ok(Self::state_from(&intervals, at))
    }
}
