use std::collections::BTreeSet;

use grove_core::Operation;
use serde::{Deserialize, Serialize};

use crate::peer::PeerIndex;
use crate::rng::SimRng;

/// Fault injection rates for the simulated network.
///
/// Delay, duplication, and reordering are harmless to a CRDT and the
/// convergence tests leave them on. Drops and partitions lose ops for good
/// (the simulator has no retransmission), so a lossy config is expected to
/// diverge; that is what the oracle is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of sends dropped outright.
    pub drop_rate_percent: u8,
    /// Percentage of sends enqueued twice.
    pub duplicate_rate_percent: u8,
    /// Percentage chance that a round's ready messages are reordered.
    pub reorder_rate_percent: u8,
    /// Percentage chance per round of toggling one peer's partition.
    pub partition_rate_percent: u8,
    /// Percentage chance per round of freezing one peer's clock.
    pub freeze_rate_percent: u8,
    /// Rounds a frozen clock stays frozen.
    pub freeze_duration_rounds: u8,
}

impl FaultConfig {
    /// Delay, duplication, and reordering only: everything a CRDT must
    /// absorb without diverging.
    #[must_use]
    pub fn lossless() -> Self {
        Self {
            max_delay_rounds: 3,
            drop_rate_percent: 0,
            duplicate_rate_percent: 20,
            reorder_rate_percent: 30,
            partition_rate_percent: 0,
            freeze_rate_percent: 10,
            freeze_duration_rounds: 2,
        }
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            duplicate_rate_percent: 5,
            reorder_rate_percent: 10,
            partition_rate_percent: 3,
            freeze_rate_percent: 3,
            freeze_duration_rounds: 2,
        }
    }
}

/// One op in flight between two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sending peer.
    pub from: PeerIndex,
    /// Receiving peer.
    pub to: PeerIndex,
    /// The replicated operation.
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    due_round: u64,
    envelope: Envelope,
}

/// What happened to one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// The envelope never entered the queue.
    pub dropped: bool,
    /// A second copy was enqueued.
    pub duplicated: bool,
    /// Rounds of delay assigned to the primary copy.
    pub delay_rounds: u8,
}

/// A round's worth of deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverOutcome {
    /// Envelopes due this round, in delivery order.
    pub delivered: Vec<Envelope>,
    /// Whether delivery order was shuffled.
    pub reordered: bool,
}

/// Fault-injecting point-to-point network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNetwork {
    in_flight: Vec<InFlight>,
    isolated: BTreeSet<PeerIndex>,
    fault: FaultConfig,
}

impl SimNetwork {
    /// Create an empty network with the given fault rates.
    #[must_use]
    pub fn new(fault: FaultConfig) -> Self {
        Self {
            in_flight: Vec::new(),
            isolated: BTreeSet::new(),
            fault,
        }
    }

    /// Isolate or reconnect one peer.
    pub fn set_isolated(&mut self, peer: PeerIndex, isolated: bool) {
        if isolated {
            self.isolated.insert(peer);
        } else {
            self.isolated.remove(&peer);
        }
    }

    /// Whether a peer is currently cut off.
    #[must_use]
    pub fn is_isolated(&self, peer: PeerIndex) -> bool {
        self.isolated.contains(&peer)
    }

    /// Envelopes still queued.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Attempt to send one envelope, applying partition, drop, delay, and
    /// duplication faults.
    #[must_use]
    pub fn send(&mut self, envelope: Envelope, round: u64, rng: &mut SimRng) -> SendOutcome {
        if self.is_isolated(envelope.from) || self.is_isolated(envelope.to) {
            return SendOutcome {
                dropped: true,
                duplicated: false,
                delay_rounds: 0,
            };
        }
        if rng.chance(self.fault.drop_rate_percent) {
            return SendOutcome {
                dropped: true,
                duplicated: false,
                delay_rounds: 0,
            };
        }

        let delay = rng.below(u64::from(self.fault.max_delay_rounds).saturating_add(1));
        let delay_rounds = u8::try_from(delay).unwrap_or(self.fault.max_delay_rounds);
        let due_round = round.saturating_add(delay);

        let duplicated = rng.chance(self.fault.duplicate_rate_percent);
        self.in_flight.push(InFlight {
            due_round,
            envelope: envelope.clone(),
        });
        if duplicated {
            self.in_flight.push(InFlight {
                due_round,
                envelope,
            });
        }

        SendOutcome {
            dropped: false,
            duplicated,
            delay_rounds,
        }
    }

    /// Pull out everything due by `round`, possibly reordered.
    #[must_use]
    pub fn deliver_due(&mut self, round: u64, rng: &mut SimRng) -> DeliverOutcome {
        let mut due = Vec::new();
        let mut still_queued = Vec::new();
        for queued in self.in_flight.drain(..) {
            if queued.due_round <= round {
                due.push(queued.envelope);
            } else {
                still_queued.push(queued);
            }
        }
        self.in_flight = still_queued;

        let reordered = due.len() > 1 && rng.chance(self.fault.reorder_rate_percent);
        if reordered {
            due.reverse();
        }

        DeliverOutcome {
            delivered: due,
            reordered,
        }
    }
}
