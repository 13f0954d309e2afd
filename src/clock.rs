//! Monotonic cluster time.
//!
//! A [`Time`] is wall-clock milliseconds plus a tie-break counter. The
//! [`Clock`] never hands out a Time smaller than one it already returned; when
//! the wall clock stalls or steps backwards the counter advances instead.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Point in cluster time. Ordered by millis, then by count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    millis: i64,
    count: i32,
}

impl Time {
    /// Zero time.
    pub const ZERO: Time = Time { millis: 0, count: 0 };

    pub const fn new(millis: i64, count: i32) -> Self {
        Self { millis, count }
    }

    pub fn millis(&self) -> i64 {
        self.millis
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    /// Time `delta` later. The counter is reset.
    pub fn add(&self, delta: Duration) -> Time {
        let delta = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);
        Time::new(self.millis.saturating_add(delta), 0)
    }

    /// Milliseconds from `earlier` to `self`, zero if `earlier` is later.
    pub fn millis_since(&self, earlier: Time) -> u64 {
        u64::try_from(self.millis - earlier.millis).unwrap_or(0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.millis, self.count)
    }
}

/// Source of wall-clock milliseconds.
pub trait WallClock: Send + Sync + 'static {
    fn now_millis(&self) -> i64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// Wall clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualWallClock {
    millis: AtomicI64,
}

impl ManualWallClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let delta = i64::try_from(delta.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Produces non-decreasing [`Time`] values for this node.
pub struct Clock {
    wall: Arc<dyn WallClock>,
    last: Mutex<Time>,
}

impl Clock {
    /// Clock driven by system time.
    pub fn system() -> Self {
        Self::with_wall_clock(Arc::new(SystemWallClock))
    }

    pub fn with_wall_clock(wall: Arc<dyn WallClock>) -> Self {
        Self {
            wall,
            last: Mutex::new(Time::ZERO),
        }
    }

    /// Clock plus the handle that drives it.
    pub fn manual(start_millis: i64) -> (Self, Arc<ManualWallClock>) {
        let wall = Arc::new(ManualWallClock::new(start_millis));
        (Self::with_wall_clock(wall.clone()), wall)
    }

    /// Next time for this node, never smaller than any returned before.
    pub fn current_time(&self) -> Time {
        let now = self.wall.now_millis();
        let mut last = self.last.lock();
        let next = if now > last.millis {
            Time::new(now, 0)
        } else if last.count == i32::MAX {
            Time::new(last.millis + 1, 0)
        } else {
            Time::new(last.millis, last.count + 1)
        };
        *last = next;
        next
    }

    /// Move the clock past a time received from another node.
    pub fn observe(&self, remote: Time) {
        let mut last = self.last.lock();
        if remote > *last {
            *last = remote;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("last", &*self.last.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ordering() {
        assert!(Time::new(10, 0) < Time::new(10, 1));
        assert!(Time::new(10, 5) < Time::new(11, 0));
        assert_eq!(Time::new(10, 3).add(Duration::from_millis(5)), Time::new(15, 0));
        assert_eq!(Time::new(20, 0).millis_since(Time::new(5, 9)), 15);
        assert_eq!(Time::new(5, 0).millis_since(Time::new(20, 0)), 0);
    }

    #[test]
    fn test_counter_advances_when_wall_clock_stalls() {
        let (clock, _wall) = Clock::manual(1_000);
        let a = clock.current_time();
        let b = clock.current_time();
        let c = clock.current_time();
        assert_eq!(a, Time::new(1_000, 0));
        assert_eq!(b, Time::new(1_000, 1));
        assert_eq!(c, Time::new(1_000, 2));
    }

    #[test]
    fn test_wall_clock_step_back_keeps_monotonic() {
        let (clock, wall) = Clock::manual(5_000);
        let before = clock.current_time();
        wall.set(4_000);
        let after = clock.current_time();
        assert!(after > before);

        wall.advance(Duration::from_secs(10));
        assert_eq!(clock.current_time(), Time::new(14_000, 0));
    }

    #[test]
    fn test_observe_remote_time() {
        let (clock, _wall) = Clock::manual(100);
        clock.observe(Time::new(900, 4));
        assert_eq!(clock.current_time(), Time::new(900, 5));

        // Older remote times do not move the clock back.
        clock.observe(Time::new(50, 0));
        assert_eq!(clock.current_time(), Time::new(900, 6));
    }
}
