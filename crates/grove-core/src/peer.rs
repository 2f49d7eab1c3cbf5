//! One replica, fully wired: store, tree, undo, and an outbound sink.
//!
//! A [`Peer`] is the unit a transport replicates. Local edits fan out from
//! the store to the tree (rebuild), the undo manager (record), and the sink
//! (forward to other peers); remote ops enter through [`Peer::receive`] and
//! reach the tree only.

use std::cell::RefCell;
use std::rc::Rc;

use crate::clock::TimeSource;
use crate::error::OpError;
use crate::op::{NodeId, Operation, PeerId};
use crate::store::{OpNotice, OpStore, Origin, StoreObserver};
use crate::tree::Tree;
use crate::undo::UndoRedo;

struct SinkObserver {
    sink: RefCell<Box<dyn FnMut(&Operation)>>,
}

impl StoreObserver for SinkObserver {
    fn on_op(&self, _store: &OpStore, notice: &OpNotice) {
        if notice.origin == Origin::Local {
            let mut sink = self.sink.borrow_mut();
            (*sink)(&notice.op);
        }
    }
}

/// A complete replica: op store, materialized tree, and undo manager.
pub struct Peer {
    store: OpStore,
    tree: Tree,
    undo: UndoRedo,
}

impl Peer {
    /// Create a peer stamping local ops from the real wall clock.
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        let store = OpStore::new(peer_id);
        Self::wire(store)
    }

    /// Create a peer with an injected time source (tests, simulation).
    #[must_use]
    pub fn with_clock(peer_id: PeerId, clock: impl TimeSource + 'static) -> Self {
        let store = OpStore::with_clock(peer_id, clock);
        Self::wire(store)
    }

    fn wire(store: OpStore) -> Self {
        // Registration order is the notification order: the tree rebuilds
        // before the undo manager records, and the sink forwards last.
        let tree = Tree::attach(&store);
        let undo = UndoRedo::attach(&store);
        Self { store, tree, undo }
    }

    /// Forward every locally-applied op to `sink`. This is the transport
    /// hookup: whatever the sink does with the op (queue, broadcast, log),
    /// delivering it to another peer's [`Peer::receive`] in any order, any
    /// number of times, converges both replicas.
    pub fn connect(&self, sink: impl FnMut(&Operation) + 'static) {
        self.store.subscribe(Rc::new(SinkObserver {
            sink: RefCell::new(Box::new(sink)),
        }));
    }

    /// Apply an op delivered from another peer.
    ///
    /// # Errors
    ///
    /// Rejects malformed ops ([`OpError::InvalidOp`]) and root mutations
    /// ([`OpError::RootMutation`]) without touching state.
    pub fn receive(&self, op: Operation) -> Result<bool, OpError> {
        self.store.apply(op, Origin::Remote)
    }

    /// Attach `child` under `parent`. See [`Tree::add_child_to_parent`].
    ///
    /// # Errors
    ///
    /// Propagates the tree edit's validation errors.
    pub fn add_child(&self, child: &NodeId, parent: &NodeId) -> Result<(), OpError> {
        self.tree.add_child_to_parent(child, parent)
    }

    /// Rename `old` to `new` as a single undo step. See [`Tree::rename`].
    ///
    /// # Errors
    ///
    /// Propagates the tree edit's validation errors.
    pub fn rename(&self, old: &NodeId, new: &NodeId) -> Result<(), OpError> {
        let tree = self.tree.clone();
        self.undo.batch(move || tree.rename(old, new))
    }

    /// Tombstone the `child -> parent` edge. See [`Tree::remove_edge`].
    ///
    /// # Errors
    ///
    /// Propagates the tree edit's validation errors.
    pub fn remove_edge(&self, child: &NodeId, parent: &NodeId) -> Result<(), OpError> {
        self.tree.remove_edge(child, parent)
    }

    /// Undo the most recent local change group.
    pub fn undo(&self) -> bool {
        self.undo.undo()
    }

    /// Redo the most recently undone group.
    pub fn redo(&self) -> bool {
        self.undo.redo()
    }

    /// The underlying op store.
    #[must_use]
    pub fn store(&self) -> &OpStore {
        &self.store
    }

    /// The materialized tree.
    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The undo/redo manager.
    #[must_use]
    pub fn undo_manager(&self) -> &UndoRedo {
        &self.undo
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.store.peer_id())
            .field("fields", &self.store.field_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn peer(name: &str, millis: i64) -> Peer {
        Peer::with_clock(PeerId::new(name), ManualClock::new(millis))
    }

    #[test]
    fn sink_sees_local_ops_only() {
        let alpha = peer("alpha", 1_000);
        let outbox: Rc<RefCell<Vec<Operation>>> = Rc::default();
        let captured = Rc::clone(&outbox);
        alpha.connect(move |op| captured.borrow_mut().push(op.clone()));

        alpha.add_child(&id("a"), &NodeId::root()).expect("add");
        assert_eq!(outbox.borrow().len(), 1);

        let remote = Operation::set(id("b"), NodeId::root(), 1, PeerId::new("bravo"), 500);
        alpha.receive(remote).expect("receive");
        assert_eq!(outbox.borrow().len(), 1);
    }

    #[test]
    fn two_peers_converge_through_sinks() {
        let alpha = peer("alpha", 1_000);
        let bravo = peer("bravo", 2_000);

        let alpha_out: Rc<RefCell<Vec<Operation>>> = Rc::default();
        let bravo_out: Rc<RefCell<Vec<Operation>>> = Rc::default();
        let capture_a = Rc::clone(&alpha_out);
        let capture_b = Rc::clone(&bravo_out);
        alpha.connect(move |op| capture_a.borrow_mut().push(op.clone()));
        bravo.connect(move |op| capture_b.borrow_mut().push(op.clone()));

        alpha.add_child(&id("src"), &NodeId::root()).expect("add");
        bravo.add_child(&id("test"), &NodeId::root()).expect("add");
        bravo.add_child(&id("src"), &id("test")).expect("move");

        // Cross-deliver, bravo's ops reversed for good measure.
        for op in alpha_out.borrow().iter() {
            bravo.receive(op.clone()).expect("receive");
        }
        for op in bravo_out.borrow().iter().rev() {
            alpha.receive(op.clone()).expect("receive");
        }

        assert_eq!(alpha.store().ops(), bravo.store().ops());
        assert_eq!(alpha.tree().layout(), bravo.tree().layout());
    }

    #[test]
    fn rename_is_one_undo_step() {
        let alpha = peer("alpha", 1_000);
        alpha.add_child(&id("dir"), &NodeId::root()).expect("add");
        alpha.add_child(&id("file"), &id("dir")).expect("add");

        alpha.rename(&id("dir"), &id("dir2")).expect("rename");
        assert_eq!(alpha.tree().parent_of(&id("file")), Some(id("dir2")));

        // One undo reverses the whole rename transaction.
        assert!(alpha.undo());
        assert_eq!(alpha.tree().parent_of(&id("file")), Some(id("dir")));
        assert!(!alpha.tree().contains(&id("dir2")) || alpha.store().get(&id("dir2"), &NodeId::root()).is_none());
    }

    #[test]
    fn remote_edits_are_outside_the_undo_scope() {
        let alpha = peer("alpha", 1_000);
        alpha.add_child(&id("a"), &NodeId::root()).expect("add");

        let remote = Operation::set(id("b"), NodeId::root(), 1, PeerId::new("bravo"), 5_000);
        alpha.receive(remote).expect("receive");

        assert!(alpha.undo());
        // Alpha's own edit is gone; bravo's survives.
        assert_eq!(alpha.store().get(&id("a"), &NodeId::root()), None);
        assert_eq!(alpha.store().get(&id("b"), &NodeId::root()), Some(1));
        assert!(!alpha.undo());
    }
}
