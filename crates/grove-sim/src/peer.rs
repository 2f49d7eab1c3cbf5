use std::cell::RefCell;
use std::rc::Rc;

use grove_core::{Layout, ManualClock, NodeId, Operation, Peer, PeerId};
use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

/// Stable identifier for a simulated peer.
pub type PeerIndex = usize;

/// What a peer did with its turn, for the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    /// Attached (or moved) a child under a parent.
    AddChild,
    /// Tombstoned the child's current parent edge.
    RemoveEdge,
    /// Renamed a node to a successor id.
    Rename,
    /// Undid the latest local change group.
    Undo,
}

/// Snapshot of one peer's replicated state after drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Peer identity.
    pub index: PeerIndex,
    /// The store's winning op per register, in key order.
    pub ops: Vec<Operation>,
    /// The materialized tree.
    pub layout: Layout,
}

/// One full grove replica under simulation control: a [`Peer`] whose clock
/// the simulator drives and whose outbound ops it collects.
pub struct SimulatedPeer {
    index: PeerIndex,
    peer: Peer,
    clock: ManualClock,
    outbox: Rc<RefCell<Vec<Operation>>>,
}

impl SimulatedPeer {
    /// Create a replica with a simulator-driven clock.
    #[must_use]
    pub fn new(index: PeerIndex) -> Self {
        let clock = ManualClock::new(0);
        let peer = Peer::with_clock(PeerId::new(format!("peer-{index:02}")), clock.clone());

        let outbox: Rc<RefCell<Vec<Operation>>> = Rc::default();
        let capture = Rc::clone(&outbox);
        peer.connect(move |op| capture.borrow_mut().push(op.clone()));

        Self {
            index,
            peer,
            clock,
            outbox,
        }
    }

    /// This peer's index.
    #[must_use]
    pub fn index(&self) -> PeerIndex {
        self.index
    }

    /// Push the simulated wall time into the replica's clock.
    pub fn set_time(&self, millis: i64) {
        self.clock.set(millis);
    }

    /// Perform one random structural edit against the local replica.
    ///
    /// Node names come from a bounded pool so peers contend on the same ids;
    /// that contention is what makes the merged edge sets interesting.
    pub fn act(&mut self, universe: usize, rng: &mut SimRng) -> EditKind {
        let roll = rng.below(100);
        if roll < 60 {
            self.random_add(universe, rng)
        } else if roll < 75 {
            self.random_remove(universe, rng)
        } else if roll < 85 {
            self.random_rename(universe, rng)
        } else {
            self.random_undo(universe, rng)
        }
    }

    /// Ops emitted since the last drain, in emission order.
    #[must_use]
    pub fn drain_outbox(&self) -> Vec<Operation> {
        std::mem::take(&mut *self.outbox.borrow_mut())
    }

    /// Deliver one op from the network.
    ///
    /// # Errors
    ///
    /// Propagates rejection of malformed ops; peers only emit well-formed
    /// ones, so an error here is a simulator bug.
    pub fn receive(&self, op: Operation) -> Result<(), grove_core::OpError> {
        self.peer.receive(op).map(|_| ())
    }

    /// Immutable snapshot for the convergence oracle.
    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            index: self.index,
            ops: self.peer.store().ops(),
            layout: self.peer.tree().layout(),
        }
    }

    fn node_name(universe: usize, rng: &mut SimRng) -> NodeId {
        NodeId::new(format!("f{}", rng.below(universe.max(1) as u64)))
    }

    fn random_add(&self, universe: usize, rng: &mut SimRng) -> EditKind {
        let child = Self::node_name(universe, rng);
        let parent = if rng.chance(25) {
            NodeId::root()
        } else {
            let candidate = Self::node_name(universe, rng);
            if candidate == child {
                NodeId::root()
            } else {
                candidate
            }
        };
        self.peer
            .add_child(&child, &parent)
            .expect("pool ids are never root or empty");
        EditKind::AddChild
    }

    fn random_remove(&self, universe: usize, rng: &mut SimRng) -> EditKind {
        let child = Self::node_name(universe, rng);
        match self.peer.tree().parent_of(&child) {
            Some(parent) => {
                self.peer
                    .remove_edge(&child, &parent)
                    .expect("pool ids are never root or empty");
                EditKind::RemoveEdge
            }
            // Unknown node: fall back to growing the tree instead.
            None => self.random_add(universe, rng),
        }
    }

    fn random_rename(&self, universe: usize, rng: &mut SimRng) -> EditKind {
        let old = Self::node_name(universe, rng);
        let new = Self::node_name(universe, rng);
        if old == new || !self.peer.tree().contains(&old) {
            return self.random_add(universe, rng);
        }
        self.peer
            .rename(&old, &new)
            .expect("pool ids are never root or empty");
        EditKind::Rename
    }

    fn random_undo(&self, universe: usize, rng: &mut SimRng) -> EditKind {
        if self.peer.undo_manager().undo_depth() == 0 {
            return self.random_add(universe, rng);
        }
        self.peer.undo();
        EditKind::Undo
    }
}

impl std::fmt::Debug for SimulatedPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedPeer")
            .field("index", &self.index)
            .field("outbox", &self.outbox.borrow().len())
            .finish()
    }
}
