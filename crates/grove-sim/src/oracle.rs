use crate::peer::{PeerIndex, PeerSnapshot};

/// Convergence verdict over a fleet of peer snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    /// Whether every peer's field state and tree agree.
    pub converged: bool,
    /// Peers whose state differs from the first peer's.
    pub divergent_peers: Vec<PeerIndex>,
    /// Registers in the canonical (first peer's) state.
    pub canonical_field_count: usize,
}

/// Compares drained peer states: op-for-op field state and the materialized
/// `(parent, children)` layout both have to match.
pub struct ConvergenceOracle;

impl ConvergenceOracle {
    /// Evaluate a fleet. An empty fleet is trivially converged.
    #[must_use]
    pub fn evaluate(snapshots: &[PeerSnapshot]) -> ConvergenceReport {
        let Some(canonical) = snapshots.first() else {
            return ConvergenceReport {
                converged: true,
                divergent_peers: Vec::new(),
                canonical_field_count: 0,
            };
        };

        let divergent_peers = snapshots
            .iter()
            .filter(|snapshot| {
                snapshot.ops != canonical.ops || snapshot.layout != canonical.layout
            })
            .map(|snapshot| snapshot.index)
            .collect::<Vec<_>>();

        ConvergenceReport {
            converged: divergent_peers.is_empty(),
            divergent_peers,
            canonical_field_count: canonical.ops.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SimulatedPeer;
    use crate::rng::SimRng;

    #[test]
    fn identical_states_converge() {
        let mut alpha = SimulatedPeer::new(0);
        let bravo = SimulatedPeer::new(1);
        alpha.set_time(1_000);
        bravo.set_time(1_000);

        let mut rng = SimRng::seeded(17);
        for _ in 0..5 {
            let _ = alpha.act(4, &mut rng);
        }
        for op in alpha.drain_outbox() {
            bravo.receive(op).expect("deliverable");
        }

        let report = ConvergenceOracle::evaluate(&[alpha.snapshot(), bravo.snapshot()]);
        assert!(report.converged);
        assert!(report.divergent_peers.is_empty());
        assert_eq!(report.canonical_field_count, alpha.snapshot().ops.len());
    }

    #[test]
    fn missing_ops_are_reported_as_divergence() {
        let mut alpha = SimulatedPeer::new(0);
        let bravo = SimulatedPeer::new(1);
        alpha.set_time(1_000);
        bravo.set_time(1_000);

        let mut rng = SimRng::seeded(17);
        for _ in 0..5 {
            let _ = alpha.act(4, &mut rng);
        }
        let mut ops = alpha.drain_outbox();
        // Lose the last op on the way to bravo.
        ops.pop();
        for op in ops {
            bravo.receive(op).expect("deliverable");
        }

        let report = ConvergenceOracle::evaluate(&[alpha.snapshot(), bravo.snapshot()]);
        assert!(!report.converged);
        assert_eq!(report.divergent_peers, vec![1]);
    }

    #[test]
    fn empty_fleet_is_trivially_converged() {
        let report = ConvergenceOracle::evaluate(&[]);
        assert!(report.converged);
        assert_eq!(report.canonical_field_count, 0);
    }
}
