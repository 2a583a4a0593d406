//! Time sources.
//!
//! Every component reads time through a [`Clock`] so tests can drive virtual
//! time instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use cueline_common::{Duration, Time};

/// Process-wide source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + 'static {
    /// The current time. Never goes backwards.
    fn now(&self) -> Time;
}

/// Wall clock guarded against stepping backwards.
///
/// If the system clock is adjusted backwards, the last returned value is
/// repeated until wall time catches up.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Time {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(epoch_millis)
            .unwrap_or_default();
        let previous = self.last.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}

/// Milliseconds in `since_epoch`, saturating at [`Time::MAX`].
fn epoch_millis(since_epoch: std::time::Duration) -> Time {
    Time::try_from(since_epoch.as_millis()).unwrap_or(Time::MAX)
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a manual clock reading `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jump to `time`. Earlier values are ignored to keep the clock monotonic.
    pub fn set(&self, time: Time) {
        self.now.fetch_max(time, Ordering::SeqCst);
    }

    /// Move forward by `delta` milliseconds.
    pub fn advance(&self, delta: Duration) {
        self.now.fetch_add(delta.max(0), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_never_goes_back() {
        let clock = ManualClock::new(1_000);
        clock.advance(500);
        assert_eq!(clock.now(), 1_500);
        clock.set(200);
        assert_eq!(clock.now(), 1_500);
        clock.set(4_000);
        assert_eq!(clock.now(), 4_000);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }

    #[test]
    fn epoch_millis_saturates() {
        assert_eq!(epoch_millis(std::time::Duration::from_millis(1_500)), 1_500);
        assert_eq!(epoch_millis(std::time::Duration::MAX), Time::MAX);
    }
}
