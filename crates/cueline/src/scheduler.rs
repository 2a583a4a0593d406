//! Per-device time-ordered command queue.
//!
//! Entries are kept sorted by execution time; entries with equal times keep
//! their insertion order. An entry leaves the queue exactly once, either by
//! being taken for execution or by a clear, and is never re-inserted.

use std::fmt::Display;

use cueline_common::{CommandContext, Duration, Time};
use tracing::{trace, warn};

/// Default slack for executing entries slightly before their time.
pub const DEFAULT_DISPATCH_TOLERANCE: Duration = 20;

/// A command waiting in a [`Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledEntry<C> {
    /// Monotonic insertion sequence number, unique per scheduler.
    pub id: u64,
    /// Intended execution time.
    pub time: Time,
    /// The device-specific command.
    pub command: C,
    /// Diagnostic context of the command.
    pub context: CommandContext,
}

/// One entry that failed during [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFailure {
    /// Id of the failed entry.
    pub id: u64,
    /// Intended execution time of the failed entry.
    pub time: Time,
    /// Rendered error.
    pub error: String,
}

/// Outcome of a [`Scheduler::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Number of entries executed successfully.
    pub executed: usize,
    /// Entries whose execution failed, in execution order.
    pub failed: Vec<TickFailure>,
}

impl TickReport {
    /// Total number of entries removed by the tick.
    pub fn attempted(&self) -> usize {
        self.executed + self.failed.len()
    }
}

/// The time-ordered command queue of one device.
#[derive(Debug, Clone)]
pub struct Scheduler<C> {
    entries: Vec<ScheduledEntry<C>>,
    next_id: u64,
    tolerance: Duration,
    taken_until: Option<Time>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new(DEFAULT_DISPATCH_TOLERANCE)
    }
}

impl<C> Scheduler<C> {
    /// Create an empty queue that executes entries up to `tolerance` ms early.
    pub fn new(tolerance: Duration) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
            tolerance: tolerance.max(0),
            taken_until: None,
        }
    }

    /// The dispatch tolerance in milliseconds.
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Insert an entry, keeping time order. Equal times keep insertion order.
    pub fn enqueue(&mut self, time: Time, command: C, context: CommandContext) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let index = self.entries.partition_point(|e| e.time <= time);
        self.entries.insert(
            index,
            ScheduledEntry {
                id,
                time,
                command,
                context,
            },
        );
        id
    }

    /// Remove every entry with `time >= cutoff`. Returns the number removed.
    pub fn clear_from_now_and_after(&mut self, cutoff: Time) -> usize {
        let keep = self.entries.partition_point(|e| e.time < cutoff);
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        if removed > 0 {
            trace!("Cleared {} entries at or after {}", removed, cutoff);
        }
        removed
    }

    /// Remove every entry with `time > cutoff`. Returns the number removed.
    pub fn clear_after(&mut self, cutoff: Time) -> usize {
        let keep = self.entries.partition_point(|e| e.time <= cutoff);
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        if removed > 0 {
            trace!("Cleared {} entries after {}", removed, cutoff);
        }
        removed
    }

    /// Replace the plan from `cutoff` on: clear `time >= cutoff`, then enqueue `entries` in order.
    ///
    /// Both halves happen under the same borrow, so a dispatcher never sees the
    /// old and the new plan mixed.
    pub fn replace_from(
        &mut self,
        cutoff: Time,
        entries: impl IntoIterator<Item = (Time, C, CommandContext)>,
    ) -> usize {
        let removed = self.clear_from_now_and_after(cutoff);
        for (time, command, context) in entries {
            self.enqueue(time, command, context);
        }
        removed
    }

    /// Remove and return, in time order, every entry due at `now` (plus tolerance).
    ///
    /// Entries whose time has long passed are returned too: late commands are
    /// caught up, never dropped.
    pub fn take_due(&mut self, now: Time) -> Vec<ScheduledEntry<C>> {
        let limit = now.saturating_add(self.tolerance);
        let due = self.entries.partition_point(|e| e.time <= limit);
        if let Some(last) = due.checked_sub(1).map(|i| self.entries[i].time) {
            self.taken_until = Some(self.taken_until.map_or(last, |t| t.max(last)));
        }
        self.entries.drain(..due).collect()
    }

    /// Latest entry time ever taken for execution.
    ///
    /// Everything planned at or before this instant has left the queue, even
    /// when it was taken ahead of its time.
    pub fn taken_until(&self) -> Option<Time> {
        self.taken_until
    }

    /// Remove and execute every due entry in ascending time order.
    ///
    /// A failing entry is reported and does not stop the remaining entries.
    pub fn tick<E, F>(&mut self, now: Time, mut execute: F) -> TickReport
    where
        E: Display,
        F: FnMut(&ScheduledEntry<C>) -> Result<(), E>,
    {
        let mut report = TickReport::default();
        for entry in self.take_due(now) {
            match execute(&entry) {
                Ok(()) => report.executed += 1,
                Err(e) => {
                    warn!(
                        "Scheduled entry {} at {} failed ({}): {}",
                        entry.id, entry.time, entry.context, e
                    );
                    report.failed.push(TickFailure {
                        id: entry.id,
                        time: entry.time,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Time of the next entry, if any.
    pub fn next_time(&self) -> Option<Time> {
        self.entries.first().map(|e| e.time)
    }

    /// Iterate queued entries in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &ScheduledEntry<C>> {
        self.entries.iter()
    }

    /// Get the number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every queued entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(reason: &str) -> CommandContext {
        CommandContext::new(reason)
    }

    fn queue(times: &[Time]) -> Scheduler<&'static str> {
        let mut scheduler = Scheduler::new(20);
        for (i, t) in times.iter().enumerate() {
            scheduler.enqueue(*t, "cmd", ctx(&format!("#{i}")));
        }
        scheduler
    }

    fn times(scheduler: &Scheduler<&'static str>) -> Vec<Time> {
        scheduler.iter().map(|e| e.time).collect()
    }

    #[test]
    fn enqueue_keeps_time_order_and_stable_ties() {
        let mut scheduler = Scheduler::new(20);
        scheduler.enqueue(300, "c", ctx("c"));
        scheduler.enqueue(100, "a", ctx("a"));
        scheduler.enqueue(300, "d", ctx("d"));
        scheduler.enqueue(200, "b", ctx("b"));
        scheduler.enqueue(100, "a2", ctx("a2"));

        let order: Vec<_> = scheduler.iter().map(|e| e.command).collect();
        assert_eq!(order, vec!["a", "a2", "b", "c", "d"]);
    }

    #[test]
    fn clear_from_now_and_after_removes_exactly_at_or_after_cutoff() {
        let base = [50, 100, 100, 150, 200, 250];
        for cutoff in [0, 50, 99, 100, 101, 200, 251, 1000] {
            let mut scheduler = queue(&base);
            let removed = scheduler.clear_from_now_and_after(cutoff);
            let expected: Vec<Time> = base.iter().copied().filter(|t| *t < cutoff).collect();
            assert_eq!(times(&scheduler), expected, "cutoff {cutoff}");
            assert_eq!(removed, base.len() - expected.len());
        }
    }

    #[test]
    fn clear_after_keeps_entry_at_cutoff() {
        let base = [50, 100, 100, 150, 200];
        for cutoff in [0, 50, 100, 149, 200, 300] {
            let mut scheduler = queue(&base);
            scheduler.clear_after(cutoff);
            let expected: Vec<Time> = base.iter().copied().filter(|t| *t <= cutoff).collect();
            assert_eq!(times(&scheduler), expected, "cutoff {cutoff}");
        }
    }

    #[test]
    fn tick_executes_due_entries_in_order_within_tolerance() {
        let mut scheduler = queue(&[130, 100, 119, 121, 500]);
        let mut seen = Vec::new();
        let report = scheduler.tick(100, |e| {
            seen.push(e.time);
            Ok::<_, String>(())
        });

        assert_eq!(seen, vec![100, 119]);
        assert_eq!(report.executed, 2);
        assert_eq!(times(&scheduler), vec![121, 130, 500]);
    }

    #[test]
    fn tick_isolates_failures() {
        let mut scheduler = queue(&[10, 20, 30]);
        let mut seen = Vec::new();
        let report = scheduler.tick(30, |e| {
            seen.push(e.time);
            if e.time == 20 { Err("boom") } else { Ok(()) }
        });

        assert_eq!(seen, vec![10, 20, 30]);
        assert_eq!(report.executed, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].time, 20);
        assert_eq!(report.failed[0].error, "boom");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn late_entries_are_caught_up_and_run_once() {
        let mut scheduler = queue(&[0, 5]);
        let first = scheduler.tick(10_000, |_| Ok::<_, String>(()));
        assert_eq!(first.executed, 2);
        let second = scheduler.tick(20_000, |_| Ok::<_, String>(()));
        assert_eq!(second.attempted(), 0);
    }

    #[test]
    fn replace_from_swaps_the_future_only() {
        let mut scheduler = queue(&[100, 200, 300]);
        let removed = scheduler.replace_from(
            200,
            vec![(250, "new", ctx("new")), (200, "new0", ctx("new0"))],
        );
        assert_eq!(removed, 2);
        let order: Vec<_> = scheduler.iter().map(|e| (e.time, e.command)).collect();
        assert_eq!(order, vec![(100, "cmd"), (200, "new0"), (250, "new")]);
        assert_eq!(scheduler.next_time(), Some(100));
    }

    #[test]
    fn taken_until_tracks_early_takes_and_survives_clears() {
        let mut scheduler = queue(&[100, 3_000, 4_000]);
        assert_eq!(scheduler.taken_until(), None);

        scheduler.take_due(2_985);
        assert_eq!(scheduler.taken_until(), Some(3_000));
        assert_eq!(times(&scheduler), vec![4_000]);

        scheduler.clear();
        assert!(scheduler.take_due(10_000).is_empty());
        assert_eq!(scheduler.taken_until(), Some(3_000));
    }
}
