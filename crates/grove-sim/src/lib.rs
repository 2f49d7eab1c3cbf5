#![forbid(unsafe_code)]
//! Deterministic simulation harness for grove tree-CRDT convergence.
//!
//! A [`Simulator`] drives a fleet of full replicas ([`SimulatedPeer`]) for a
//! fixed number of rounds. Each round every peer performs a random
//! structural edit, broadcasts the resulting ops through a fault-injecting
//! network (delay, duplication, reordering, drops, partitions), and delivers
//! whatever is due. Per-peer clocks drift, skew, and occasionally freeze.
//! After a bounded final drain, the [`ConvergenceOracle`] compares every
//! peer's op log and materialized tree.
//!
//! All nondeterminism flows from one seeded RNG: the same
//! [`SimulationConfig`] always replays to the same trace, states, and
//! verdict.

pub mod clock;
pub mod network;
pub mod oracle;
pub mod peer;
pub mod rng;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::clock::{ClockConfig, PeerClock};
use crate::network::{DeliverOutcome, Envelope, FaultConfig, SimNetwork};
use crate::oracle::{ConvergenceOracle, ConvergenceReport};
use crate::peer::{EditKind, PeerIndex, PeerSnapshot, SimulatedPeer};
use crate::rng::SimRng;

/// Why an envelope was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// Random loss injection.
    RandomLoss,
    /// Sender or receiver was partitioned.
    Partition,
}

/// One entry in the deterministic execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Simulation round.
    pub round: u64,
    /// Event payload.
    pub kind: TraceEventKind,
}

/// Trace event payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceEventKind {
    /// A peer performed a local edit.
    Edit {
        /// Editing peer.
        peer: PeerIndex,
        /// What kind of edit.
        kind: EditKind,
        /// Ops the edit put in the outbox.
        ops_emitted: usize,
    },
    /// An envelope entered the network.
    Send {
        /// Sender.
        from: PeerIndex,
        /// Receiver.
        to: PeerIndex,
        /// Assigned delay.
        delay_rounds: u8,
        /// Whether a duplicate copy was enqueued.
        duplicated: bool,
    },
    /// An envelope was dropped.
    Drop {
        /// Sender.
        from: PeerIndex,
        /// Receiver.
        to: PeerIndex,
        /// Why.
        reason: DropReason,
    },
    /// An envelope reached its receiver.
    Deliver {
        /// Sender.
        from: PeerIndex,
        /// Receiver.
        to: PeerIndex,
    },
    /// A round's ready envelopes were shuffled before delivery.
    Reorder {
        /// How many envelopes were affected.
        delivered_count: usize,
    },
    /// A peer's partition state toggled.
    Partition {
        /// Affected peer.
        peer: PeerIndex,
        /// New isolation state.
        isolated: bool,
    },
    /// A peer's clock froze.
    ClockFreeze {
        /// Affected peer.
        peer: PeerIndex,
        /// Round the freeze lifts (exclusive).
        until_round: u64,
    },
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed for all nondeterminism.
    pub seed: u64,
    /// Fleet size.
    pub peer_count: usize,
    /// Rounds before the final drain.
    pub rounds: u64,
    /// Structural edits per peer per round.
    pub edits_per_round: usize,
    /// Size of the shared node-name pool.
    pub universe_size: usize,
    /// Network fault rates.
    pub fault: FaultConfig,
    /// Clock drift/skew bounds.
    pub clock: ClockConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            peer_count: 4,
            rounds: 24,
            edits_per_round: 1,
            universe_size: 10,
            fault: FaultConfig::default(),
            clock: ClockConfig::default(),
        }
    }
}

/// Replay descriptor: the config is the whole execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReplay {
    /// Config required for exact replay.
    pub config: SimulationConfig,
}

impl SeedReplay {
    /// Capture replay metadata from a config.
    #[must_use]
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Re-execute and return the deterministic result.
    ///
    /// # Errors
    ///
    /// Returns an error when the captured config is invalid.
    pub fn replay(&self) -> Result<SimulationResult> {
        Simulator::new(self.config.clone())?.run()
    }
}

/// Completed run: trace, final states, and the oracle's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationResult {
    /// Full deterministic execution trace.
    pub trace: Vec<TraceEvent>,
    /// Final per-peer snapshots after drain.
    pub snapshots: Vec<PeerSnapshot>,
    /// The oracle's convergence verdict.
    pub convergence: ConvergenceReport,
    /// Whether any fault state (drop, reorder, partition, freeze) occurred.
    pub interesting_state_reached: bool,
}

impl SimulationResult {
    /// Stable FNV-1a fingerprint of the trace for cross-run comparison.
    #[must_use]
    pub fn trace_fingerprint(&self) -> u64 {
        let mut hash = 0xCBF2_9CE4_8422_2325_u64;
        for event in &self.trace {
            for byte in format!("{event:?}").bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
            }
        }
        hash
    }
}

/// Deterministic multi-peer simulator.
pub struct Simulator {
    config: SimulationConfig,
    peers: Vec<SimulatedPeer>,
    clocks: Vec<PeerClock>,
    clock_unfreeze_round: Vec<Option<u64>>,
    network: SimNetwork,
    rng: SimRng,
}

impl Simulator {
    /// Build a simulator, validating the config.
    ///
    /// # Errors
    ///
    /// Returns an error when any count in the config is zero.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        if config.peer_count == 0 {
            bail!("peer_count must be > 0");
        }
        if config.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if config.edits_per_round == 0 {
            bail!("edits_per_round must be > 0");
        }
        if config.universe_size == 0 {
            bail!("universe_size must be > 0");
        }

        let mut rng = SimRng::seeded(config.seed);

        let mut clocks = Vec::with_capacity(config.peer_count);
        for _ in 0..config.peer_count {
            let drift = signed_sample(&mut rng, i64::from(config.clock.max_abs_drift_ppm));
            let skew = signed_sample(&mut rng, config.clock.max_abs_skew_millis);
            clocks.push(PeerClock::new(
                &config.clock,
                i32::try_from(drift).unwrap_or(0),
                skew,
            ));
        }

        let peers = (0..config.peer_count).map(SimulatedPeer::new).collect();

        Ok(Self {
            clock_unfreeze_round: vec![None; config.peer_count],
            network: SimNetwork::new(config.fault),
            peers,
            clocks,
            rng,
            config,
        })
    }

    /// Run every round plus the final drain, then ask the oracle.
    ///
    /// # Errors
    ///
    /// Returns an error if a peer rejects a delivered op, which would mean
    /// the simulator itself forged an invalid one.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let mut trace = Vec::new();

        for round in 0..self.config.rounds {
            self.lift_expired_freezes(round);
            self.maybe_toggle_partition(round, &mut trace);
            self.maybe_freeze_clock(round, &mut trace);

            for index in 0..self.peers.len() {
                self.peers[index].set_time(self.clocks[index].millis_at(round));
            }

            for index in 0..self.peers.len() {
                for _ in 0..self.config.edits_per_round {
                    let kind = self.peers[index].act(self.config.universe_size, &mut self.rng);
                    let ops = self.peers[index].drain_outbox();
                    trace.push(TraceEvent {
                        round,
                        kind: TraceEventKind::Edit {
                            peer: index,
                            kind,
                            ops_emitted: ops.len(),
                        },
                    });
                    self.broadcast(index, ops, round, &mut trace);
                }
            }

            self.deliver_round(round, &mut trace)?;
        }

        self.final_drain(&mut trace)?;

        let snapshots = self
            .peers
            .iter()
            .map(SimulatedPeer::snapshot)
            .collect::<Vec<_>>();
        let convergence = ConvergenceOracle::evaluate(&snapshots);
        let interesting_state_reached = trace.iter().any(|event| {
            matches!(
                event.kind,
                TraceEventKind::Drop { .. }
                    | TraceEventKind::Reorder { .. }
                    | TraceEventKind::Partition { .. }
                    | TraceEventKind::ClockFreeze { .. }
            )
        });

        Ok(SimulationResult {
            trace,
            snapshots,
            convergence,
            interesting_state_reached,
        })
    }

    fn broadcast(
        &mut self,
        from: PeerIndex,
        ops: Vec<grove_core::Operation>,
        round: u64,
        trace: &mut Vec<TraceEvent>,
    ) {
        for op in ops {
            for to in 0..self.peers.len() {
                if to == from {
                    continue;
                }

                let partition_blocked =
                    self.network.is_isolated(from) || self.network.is_isolated(to);
                let outcome = self.network.send(
                    Envelope {
                        from,
                        to,
                        op: op.clone(),
                    },
                    round,
                    &mut self.rng,
                );

                if outcome.dropped {
                    trace.push(TraceEvent {
                        round,
                        kind: TraceEventKind::Drop {
                            from,
                            to,
                            reason: if partition_blocked {
                                DropReason::Partition
                            } else {
                                DropReason::RandomLoss
                            },
                        },
                    });
                } else {
                    trace.push(TraceEvent {
                        round,
                        kind: TraceEventKind::Send {
                            from,
                            to,
                            delay_rounds: outcome.delay_rounds,
                            duplicated: outcome.duplicated,
                        },
                    });
                }
            }
        }
    }

    fn deliver_round(&mut self, round: u64, trace: &mut Vec<TraceEvent>) -> Result<()> {
        let DeliverOutcome {
            delivered,
            reordered,
        } = self.network.deliver_due(round, &mut self.rng);

        if reordered {
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Reorder {
                    delivered_count: delivered.len(),
                },
            });
        }

        for envelope in delivered {
            if let Some(peer) = self.peers.get(envelope.to) {
                peer.receive(envelope.op)?;
            }
            trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Deliver {
                    from: envelope.from,
                    to: envelope.to,
                },
            });
        }
        Ok(())
    }

    fn final_drain(&mut self, trace: &mut Vec<TraceEvent>) -> Result<()> {
        let mut round = self.config.rounds;
        let limit = self.config.rounds.saturating_add(1_000);

        while self.network.in_flight_len() > 0 && round < limit {
            self.deliver_round(round, trace)?;
            round = round.saturating_add(1);
        }
        Ok(())
    }

    fn maybe_toggle_partition(&mut self, round: u64, trace: &mut Vec<TraceEvent>) {
        if !self.rng.chance(self.config.fault.partition_rate_percent) {
            return;
        }

        let peer = self.rng.index(self.peers.len());
        let isolated = !self.network.is_isolated(peer);
        self.network.set_isolated(peer, isolated);

        trace.push(TraceEvent {
            round,
            kind: TraceEventKind::Partition { peer, isolated },
        });
    }

    fn lift_expired_freezes(&mut self, round: u64) {
        for (index, maybe_until) in self.clock_unfreeze_round.iter_mut().enumerate() {
            if let Some(until_round) = *maybe_until {
                if round >= until_round {
                    if let Some(clock) = self.clocks.get_mut(index) {
                        clock.unfreeze();
                    }
                    *maybe_until = None;
                }
            }
        }
    }

    fn maybe_freeze_clock(&mut self, round: u64, trace: &mut Vec<TraceEvent>) {
        if self.config.fault.freeze_duration_rounds == 0 {
            return;
        }
        if !self.rng.chance(self.config.fault.freeze_rate_percent) {
            return;
        }

        let index = self.rng.index(self.clocks.len());
        let Some(clock) = self.clocks.get_mut(index) else {
            return;
        };
        if clock.is_frozen() {
            return;
        }

        clock.freeze(round);
        let until_round =
            round.saturating_add(u64::from(self.config.fault.freeze_duration_rounds));
        self.clock_unfreeze_round[index] = Some(until_round);
        trace.push(TraceEvent {
            round,
            kind: TraceEventKind::ClockFreeze {
                peer: index,
                until_round,
            },
        });
    }
}

fn signed_sample(rng: &mut SimRng, max_abs: i64) -> i64 {
    if max_abs <= 0 {
        return 0;
    }
    let span = max_abs.saturating_mul(2).saturating_add(1);
    let sampled = i64::try_from(rng.below(u64::try_from(span).unwrap_or(1))).unwrap_or(0);
    sampled - max_abs
}
