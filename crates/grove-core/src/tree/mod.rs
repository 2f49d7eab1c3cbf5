//! The Tree component: a rooted, acyclic view over the op store's edge set.
//!
//! The tree observes every applied operation, folds it into its candidate
//! edge map (`child -> parent -> counter`), and re-materializes. It never
//! stores derived state beyond the last [`Layout`]; the layout is always
//! recomputable from the edge map alone.
//!
//! Structural edits go the other way: they read the current layout, compute
//! one or more LWW writes, and push them through the store. The store's
//! observer fan-out then brings the tree (and everyone else) up to date.

pub mod materialize;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::error::OpError;
use crate::op::{NodeId, Operation};
use crate::store::{OpNotice, OpStore, StoreObserver};

pub use materialize::{materialize, preferred_edge, EdgeMap, Layout};

struct TreeInner {
    edges: EdgeMap,
    layout: Layout,
}

impl TreeInner {
    fn new() -> Self {
        Self {
            edges: EdgeMap::new(),
            layout: materialize(&EdgeMap::new()),
        }
    }

    /// Nodes exist from the first operation that mentions them, as entity or
    /// as field key, winning or losing.
    fn note_ids(&mut self, entity_id: &NodeId, field_key: &NodeId) {
        if !entity_id.is_root() {
            self.edges.entry(entity_id.clone()).or_default();
        }
        if !field_key.is_root() {
            self.edges.entry(field_key.clone()).or_default();
        }
    }

    fn set_edge(&mut self, child: &NodeId, parent: &NodeId, counter: Option<i64>) {
        let candidates = self.edges.entry(child.clone()).or_default();
        match counter {
            Some(value) => {
                candidates.insert(parent.clone(), value);
            }
            None => {
                candidates.remove(parent);
            }
        }
    }

    fn ingest(&mut self, op: &Operation) {
        self.note_ids(&op.entity_id, &op.field_key);
        self.set_edge(&op.entity_id, &op.field_key, op.visible_value());
    }

    fn rematerialize(&mut self) {
        self.layout = materialize(&self.edges);
    }
}

struct TreeObserver {
    inner: Rc<RefCell<TreeInner>>,
}

impl StoreObserver for TreeObserver {
    fn on_op(&self, store: &OpStore, notice: &OpNotice) {
        // The notice names the field; the field's winner may be the incoming
        // op or the one it lost to, so re-read the register.
        let winner = store.field_op(&notice.op.entity_id, &notice.op.field_key);
        let mut inner = self.inner.borrow_mut();
        inner.note_ids(&notice.op.entity_id, &notice.op.field_key);
        inner.set_edge(
            &notice.op.entity_id,
            &notice.op.field_key,
            winner.as_ref().and_then(Operation::visible_value),
        );
        inner.rematerialize();
    }
}

/// Cheaply-cloneable handle to the materialized tree of one peer.
#[derive(Clone)]
pub struct Tree {
    inner: Rc<RefCell<TreeInner>>,
    store: OpStore,
}

impl Tree {
    /// Attach a tree to a store: seed from the store's current field state,
    /// then subscribe for every future operation.
    #[must_use]
    pub fn attach(store: &OpStore) -> Self {
        let mut seed = TreeInner::new();
        for op in store.ops() {
            seed.ingest(&op);
        }
        seed.rematerialize();

        let inner = Rc::new(RefCell::new(seed));
        store.subscribe(Rc::new(TreeObserver {
            inner: Rc::clone(&inner),
        }));

        Self {
            inner,
            store: store.clone(),
        }
    }

    /// The parent of `node` in the materialized tree. `None` for the root
    /// and for unknown ids.
    #[must_use]
    pub fn parent_of(&self, node: &NodeId) -> Option<NodeId> {
        self.inner.borrow().layout.parent_of(node).cloned()
    }

    /// The sorted children of `node`.
    #[must_use]
    pub fn children_of(&self, node: &NodeId) -> Vec<NodeId> {
        self.inner.borrow().layout.children_of(node).to_vec()
    }

    /// Whether the tree knows this id.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.inner.borrow().layout.contains(node)
    }

    /// Snapshot of the current `(parent, children)` relations.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.inner.borrow().layout.clone()
    }

    /// The candidate edges currently held for `node`.
    #[must_use]
    pub fn edges_of(&self, node: &NodeId) -> BTreeMap<NodeId, i64> {
        self.inner
            .borrow()
            .edges
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Attach `child` under `new_parent`, creating either node as needed.
    ///
    /// Before writing the primary edge, the edit walks upward from the
    /// child's current parent and from `new_parent`; any ancestor whose
    /// preferred edge disagrees with its materialized parent gets a rooting
    /// refresh: its current parent republished with a fresh dominating
    /// counter. Without the refresh, a concurrent move elsewhere in the tree
    /// could detach the ancestor's subtree once the edge sets merge.
    ///
    /// # Errors
    ///
    /// [`OpError::RootMutation`] when `child` is the root;
    /// [`OpError::InvalidOp`] on empty ids.
    pub fn add_child_to_parent(&self, child: &NodeId, new_parent: &NodeId) -> Result<(), OpError> {
        if child.is_root() {
            return Err(OpError::RootMutation(new_parent.clone()));
        }
        if child.is_empty() || new_parent.is_empty() {
            return Err(OpError::InvalidOp("empty node id".to_string()));
        }

        let refreshes = {
            let inner = self.inner.borrow();
            let old_parent = inner.layout.parent_of(child).cloned();
            collect_rooting_refreshes(&inner, [old_parent, Some(new_parent.clone())])
        };
        for (ancestor, keep_parent) in refreshes {
            let counter = self.next_counter(&ancestor);
            self.store.set(&ancestor, &keep_parent, counter)?;
        }

        let counter = self.next_counter(child);
        self.store.set(child, new_parent, counter)
    }

    /// Give `old` a successor id: `new` takes over the old node's parent and
    /// children. The old node is not deleted; it stays in the tree, stripped
    /// of its children. Every write carries a fresh dominating counter.
    ///
    /// # Errors
    ///
    /// [`OpError::RootMutation`] when either id is the root;
    /// [`OpError::InvalidOp`] on empty ids.
    pub fn rename(&self, old: &NodeId, new: &NodeId) -> Result<(), OpError> {
        if old.is_root() {
            return Err(OpError::RootMutation(new.clone()));
        }
        if new.is_root() {
            return Err(OpError::RootMutation(old.clone()));
        }
        if old.is_empty() || new.is_empty() {
            return Err(OpError::InvalidOp("empty node id".to_string()));
        }

        let (parent, children) = {
            let inner = self.inner.borrow();
            let parent = inner
                .layout
                .parent_of(old)
                .cloned()
                .unwrap_or_else(NodeId::root);
            (parent, inner.layout.children_of(old).to_vec())
        };

        let counter = self.next_counter(new);
        self.store.set(new, &parent, counter)?;

        for child in &children {
            let counter = self.next_counter(child);
            self.store.set(child, new, counter)?;
        }
        Ok(())
    }

    /// Tombstone the `child -> parent` edge. A node that loses its last edge
    /// stays known and reattaches under the root at materialization.
    ///
    /// # Errors
    ///
    /// [`OpError::RootMutation`] when `child` is the root;
    /// [`OpError::InvalidOp`] on empty ids.
    pub fn remove_edge(&self, child: &NodeId, parent: &NodeId) -> Result<(), OpError> {
        if child.is_root() {
            return Err(OpError::RootMutation(parent.clone()));
        }
        self.store.delete(child, parent)
    }

    /// Counter strictly greater than every edge currently on `node`.
    fn next_counter(&self, node: &NodeId) -> i64 {
        let inner = self.inner.borrow();
        inner
            .edges
            .get(node)
            .and_then(|candidates| candidates.values().copied().max())
            .unwrap_or(0)
            .saturating_add(1)
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Tree")
            .field("nodes", &inner.layout.len())
            .finish()
    }
}

/// Walk upward from each start node collecting `(ancestor, current_parent)`
/// pairs whose preferred edge no longer points at the materialized parent.
fn collect_rooting_refreshes(
    inner: &TreeInner,
    starts: [Option<NodeId>; 2],
) -> Vec<(NodeId, NodeId)> {
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let mut refreshes = Vec::new();

    for start in starts.into_iter().flatten() {
        let mut current = start;
        loop {
            if current.is_root() || !seen.insert(current.clone()) {
                break;
            }
            let Some(tree_parent) = inner.layout.parent_of(&current).cloned() else {
                break;
            };
            let preferred = inner
                .edges
                .get(&current)
                .and_then(|candidates| preferred_edge(candidates).cloned());
            if preferred.as_ref() != Some(&tree_parent) {
                refreshes.push((current.clone(), tree_parent.clone()));
            }
            current = tree_parent;
        }
    }

    refreshes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::op::PeerId;
    use crate::store::Origin;

    fn fixture(peer: &str) -> (OpStore, Tree) {
        let store = OpStore::with_clock(PeerId::new(peer), ManualClock::new(1_000));
        let tree = Tree::attach(&store);
        (store, tree)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn add_child_builds_the_tree() {
        let (_store, tree) = fixture("alpha");
        tree.add_child_to_parent(&id("docs"), &NodeId::root())
            .expect("add");
        tree.add_child_to_parent(&id("notes"), &id("docs")).expect("add");

        assert_eq!(tree.parent_of(&id("docs")), Some(NodeId::root()));
        assert_eq!(tree.parent_of(&id("notes")), Some(id("docs")));
        assert_eq!(tree.children_of(&id("docs")), vec![id("notes")]);
    }

    #[test]
    fn moving_a_child_bumps_its_counter() {
        let (_store, tree) = fixture("alpha");
        tree.add_child_to_parent(&id("a"), &NodeId::root()).expect("add");
        tree.add_child_to_parent(&id("b"), &NodeId::root()).expect("add");
        tree.add_child_to_parent(&id("x"), &id("a")).expect("add");
        tree.add_child_to_parent(&id("x"), &id("b")).expect("move");

        assert_eq!(tree.parent_of(&id("x")), Some(id("b")));
        let edges = tree.edges_of(&id("x"));
        assert_eq!(edges.get(&id("a")), Some(&1));
        assert_eq!(edges.get(&id("b")), Some(&2));
    }

    #[test]
    fn nodes_are_created_by_any_mentioning_op() {
        let (store, tree) = fixture("alpha");

        // A remote op mentioning two unknown ids creates both.
        let op = Operation::set(id("leaf"), id("branch"), 1, PeerId::new("bravo"), 500);
        store.apply(op, Origin::Remote).expect("apply");

        assert!(tree.contains(&id("leaf")));
        assert!(tree.contains(&id("branch")));
        // "branch" has no edges of its own, so neither chain reaches the
        // root yet; both sit under the root until branch gains a real edge.
        assert_eq!(tree.parent_of(&id("branch")), Some(NodeId::root()));
        assert_eq!(tree.parent_of(&id("leaf")), Some(NodeId::root()));

        // Once branch is anchored, leaf's edge becomes ready and wins back.
        let anchor = Operation::set(id("branch"), NodeId::root(), 1, PeerId::new("bravo"), 501);
        store.apply(anchor, Origin::Remote).expect("apply");
        assert_eq!(tree.parent_of(&id("leaf")), Some(id("branch")));
    }

    #[test]
    fn losing_op_still_creates_nodes() {
        let (store, tree) = fixture("alpha");
        let winner = Operation::set(id("x"), id("p"), 2, PeerId::new("bravo"), 900);
        let loser = Operation::set(id("x"), id("q"), 1, PeerId::new("bravo"), 100);
        store.apply(winner, Origin::Remote).expect("apply");
        // Different field, so this op actually wins its own register; make a
        // true loser on the same register instead.
        let stale = Operation::set(id("x"), id("p"), 7, PeerId::new("stale"), 100);
        store.apply(stale, Origin::Remote).expect("apply");
        store.apply(loser, Origin::Remote).expect("apply");

        assert!(tree.contains(&id("p")));
        assert!(tree.contains(&id("q")));
        // The stale write neither changed the edge counter nor the layout.
        assert_eq!(tree.edges_of(&id("x")).get(&id("p")), Some(&2));
    }

    #[test]
    fn remove_edge_detaches_and_falls_back_under_root() {
        let (_store, tree) = fixture("alpha");
        tree.add_child_to_parent(&id("a"), &NodeId::root()).expect("add");
        tree.add_child_to_parent(&id("x"), &id("a")).expect("add");
        tree.remove_edge(&id("x"), &id("a")).expect("remove");

        assert!(tree.contains(&id("x")));
        assert_eq!(tree.parent_of(&id("x")), Some(NodeId::root()));
        assert!(tree.edges_of(&id("x")).is_empty());
    }

    #[test]
    fn move_republishes_stale_ancestors() {
        let (store, tree) = fixture("alpha");

        // Remote state: x prefers y (counter 2) but also has a root edge
        // (counter 1); y prefers x. Materialization breaks the cycle through
        // x's root edge, so x's preferred edge disagrees with its tree
        // parent.
        for op in [
            Operation::set(id("x"), id("y"), 2, PeerId::new("bravo"), 100),
            Operation::set(id("x"), NodeId::root(), 1, PeerId::new("bravo"), 101),
            Operation::set(id("y"), id("x"), 2, PeerId::new("bravo"), 102),
        ] {
            store.apply(op, Origin::Remote).expect("apply");
        }
        assert_eq!(tree.parent_of(&id("x")), Some(NodeId::root()));
        assert_eq!(tree.parent_of(&id("y")), Some(id("x")));

        // Attaching under x walks up from x and republishes its materialized
        // parent with a dominating counter.
        tree.add_child_to_parent(&id("z"), &id("x")).expect("add");

        let x_edges = tree.edges_of(&id("x"));
        assert_eq!(x_edges.get(&NodeId::root()), Some(&3));
        assert_eq!(tree.parent_of(&id("z")), Some(id("x")));
        assert_eq!(tree.parent_of(&id("x")), Some(NodeId::root()));
    }

    #[test]
    fn rename_moves_children_to_successor() {
        let (_store, tree) = fixture("alpha");
        tree.add_child_to_parent(&id("dir"), &NodeId::root()).expect("add");
        tree.add_child_to_parent(&id("a"), &id("dir")).expect("add");
        tree.add_child_to_parent(&id("b"), &id("dir")).expect("add");

        tree.rename(&id("dir"), &id("dir2")).expect("rename");

        assert_eq!(tree.parent_of(&id("dir2")), Some(NodeId::root()));
        assert_eq!(tree.parent_of(&id("a")), Some(id("dir2")));
        assert_eq!(tree.parent_of(&id("b")), Some(id("dir2")));
        // The old id persists, stripped of children.
        assert!(tree.contains(&id("dir")));
        assert!(tree.children_of(&id("dir")).is_empty());
    }

    #[test]
    fn rename_counter_dominates_existing_edges() {
        let (store, tree) = fixture("alpha");
        tree.add_child_to_parent(&id("dir"), &NodeId::root()).expect("add");

        // The successor id already exists elsewhere with a high counter; the
        // rename write must still win on that node.
        let op = Operation::set(id("dir2"), id("elsewhere"), 40, PeerId::new("bravo"), 50);
        store.apply(op, Origin::Remote).expect("apply");

        tree.rename(&id("dir"), &id("dir2")).expect("rename");
        assert_eq!(tree.parent_of(&id("dir2")), Some(NodeId::root()));
        assert_eq!(tree.edges_of(&id("dir2")).get(&NodeId::root()), Some(&41));
    }

    #[test]
    fn root_edits_are_rejected() {
        let (_store, tree) = fixture("alpha");
        assert!(tree
            .add_child_to_parent(&NodeId::root(), &id("a"))
            .is_err());
        assert!(tree.remove_edge(&NodeId::root(), &id("a")).is_err());
        assert!(tree.rename(&NodeId::root(), &id("a")).is_err());
        assert!(tree.rename(&id("a"), &NodeId::root()).is_err());
    }

    #[test]
    fn attach_seeds_from_existing_store_state() {
        let store = OpStore::with_clock(PeerId::new("alpha"), ManualClock::new(1_000));
        store.set(&id("a"), &NodeId::root(), 1).expect("set");
        store.set(&id("b"), &id("a"), 1).expect("set");

        // Attached late, the tree still sees the whole edge set.
        let tree = Tree::attach(&store);
        assert_eq!(tree.parent_of(&id("b")), Some(id("a")));
    }
}
