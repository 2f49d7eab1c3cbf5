//! Timestamp sources for local operations.
//!
//! The store stamps local writes with wall-clock milliseconds and bumps the
//! result past the current field winner (`max(now, existing + 1)`), so
//! convergence never depends on clock quality. A skewed clock only affects
//! which concurrent writer wins ties; causal consistency is out of scope and
//! would be layered on top with a Lamport or hybrid-logical clock.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds for local operations.
pub trait TimeSource {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&mut self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_millis(&mut self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Externally-driven clock for tests and simulation.
///
/// Cloning yields a second handle onto the same instant, so a test can hold
/// one handle while the store owns the other.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Rc<Cell<i64>>,
}

impl ManualClock {
    /// Create a manual clock starting at `millis`.
    #[must_use]
    pub fn new(millis: i64) -> Self {
        Self {
            millis: Rc::new(Cell::new(millis)),
        }
    }

    /// Move the clock to an absolute time. Moving backwards is allowed; the
    /// store's monotonic bump still keeps local timestamps advancing.
    pub fn set(&self, millis: i64) {
        self.millis.set(millis);
    }

    /// Advance the clock by a delta.
    pub fn advance(&self, delta_millis: i64) {
        self.millis.set(self.millis.get().saturating_add(delta_millis));
    }

    /// Read without advancing.
    #[must_use]
    pub fn peek(&self) -> i64 {
        self.millis.get()
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&mut self) -> i64 {
        self.millis.get()
    }
}
