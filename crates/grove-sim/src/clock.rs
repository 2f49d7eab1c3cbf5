use serde::{Deserialize, Serialize};

/// Bounds for generating per-peer clock behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Baseline timestamp in milliseconds shared by all peers.
    pub base_millis: i64,
    /// Milliseconds of nominal progress per simulation round.
    pub tick_millis: i64,
    /// Maximum absolute per-peer drift in parts-per-million.
    pub max_abs_drift_ppm: i32,
    /// Maximum absolute per-peer constant skew in milliseconds.
    pub max_abs_skew_millis: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            base_millis: 1_700_000_000_000,
            tick_millis: 100,
            max_abs_drift_ppm: 200,
            max_abs_skew_millis: 50,
        }
    }
}

/// One peer's wall clock: skewed, drifting, and freezable.
///
/// The simulator pushes `millis_at(round)` into the peer's `ManualClock`
/// each round. Frozen clocks stop advancing, which stalls that peer's raw
/// timestamps; the store's per-field monotonic bump keeps its local writes
/// ordered regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerClock {
    base_millis: i64,
    tick_millis: i64,
    drift_ppm: i32,
    skew_millis: i64,
    frozen_at: Option<i64>,
}

impl PeerClock {
    /// Build a clock with a concrete drift/skew assignment.
    #[must_use]
    pub fn new(config: &ClockConfig, drift_ppm: i32, skew_millis: i64) -> Self {
        Self {
            base_millis: config.base_millis,
            tick_millis: config.tick_millis,
            drift_ppm,
            skew_millis,
            frozen_at: None,
        }
    }

    /// Wall time this peer reads at the given round.
    #[must_use]
    pub fn millis_at(&self, round: u64) -> i64 {
        if let Some(frozen) = self.frozen_at {
            return frozen;
        }

        let round = i64::try_from(round).unwrap_or(i64::MAX);
        let nominal = self.tick_millis.saturating_mul(round);
        let drift = nominal
            .saturating_mul(i64::from(self.drift_ppm))
            .saturating_div(1_000_000);

        self.base_millis
            .saturating_add(self.skew_millis)
            .saturating_add(nominal)
            .saturating_add(drift)
    }

    /// Stop the clock at its current reading.
    pub fn freeze(&mut self, round: u64) {
        self.frozen_at = Some(self.millis_at(round));
    }

    /// Resume normal progress.
    pub fn unfreeze(&mut self) {
        self.frozen_at = None;
    }

    /// Whether the clock is currently frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skew_offsets_every_reading() {
        let config = ClockConfig::default();
        let ahead = PeerClock::new(&config, 0, 25);
        let behind = PeerClock::new(&config, 0, -25);
        assert_eq!(ahead.millis_at(4) - behind.millis_at(4), 50);
    }

    #[test]
    fn drift_accumulates_with_rounds() {
        let config = ClockConfig {
            tick_millis: 1_000,
            ..ClockConfig::default()
        };
        let fast = PeerClock::new(&config, 1_000, 0);
        let exact = PeerClock::new(&config, 0, 0);
        // 1000 ppm over 100 seconds of progress is 100ms.
        assert_eq!(fast.millis_at(100) - exact.millis_at(100), 100);
    }

    #[test]
    fn frozen_clock_stops_and_resumes() {
        let config = ClockConfig::default();
        let mut clock = PeerClock::new(&config, 0, 0);
        let at_freeze = clock.millis_at(10);

        clock.freeze(10);
        assert!(clock.is_frozen());
        assert_eq!(clock.millis_at(50), at_freeze);

        clock.unfreeze();
        assert!(clock.millis_at(50) > at_freeze);
    }
}
