//! Local undo/redo over the observed operation stream.
//!
//! The manager records inverse values for **local** edits only: on every
//! local notification it appends `{entity, field, prior value}` to a pending
//! group, and commits the group to the undo stack (one group per edit, or one
//! per [`UndoRedo::batch`] scope). Undoing replays the recorded values
//! through the store's normal local write path, so restored values carry
//! fresh dominating timestamps: undo wins over the field's current state,
//! not over history. Remote edits are never recorded; peers are independent
//! undo scopes.
//!
//! While a group replays, the `busy` flag suppresses recording, otherwise the
//! manager would observe its own writes and push garbage groups. This is the
//! canonical re-entrancy guard for observers that write to the store from
//! their own notification path.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::op::NodeId;
use crate::store::{OpNotice, OpStore, Origin, StoreObserver};

/// One recorded inverse: writing `value` back restores the field as it was
/// before the edit. `None` restores by tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    /// Entity of the recorded field.
    pub entity_id: NodeId,
    /// Field key of the recorded field.
    pub field_key: NodeId,
    /// The field's visible value before the edit; `None` when it was absent
    /// or tombstoned.
    pub value: Option<i64>,
}

/// A group of inverses undone or redone as one step.
pub type ChangeGroup = Vec<ChangeEntry>;

#[derive(Debug, Default)]
struct UndoInner {
    undo: Vec<ChangeGroup>,
    redo: Vec<ChangeGroup>,
    pending: ChangeGroup,
    depth: u32,
    busy: bool,
    filter: Option<BTreeSet<NodeId>>,
}

impl UndoInner {
    fn commit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let group = std::mem::take(&mut self.pending);
        self.undo.push(group);
        self.redo.clear();
    }
}

struct UndoRecorder {
    inner: Rc<RefCell<UndoInner>>,
}

impl StoreObserver for UndoRecorder {
    fn on_op(&self, _store: &OpStore, notice: &OpNotice) {
        let mut inner = self.inner.borrow_mut();
        if notice.origin != Origin::Local || inner.busy {
            return;
        }
        if let Some(filter) = &inner.filter {
            if !filter.contains(&notice.op.field_key) {
                return;
            }
        }

        inner.pending.push(ChangeEntry {
            entity_id: notice.op.entity_id.clone(),
            field_key: notice.op.field_key.clone(),
            value: notice.old_value,
        });
        if inner.depth == 0 {
            inner.commit_pending();
        }
    }
}

enum ReplayTarget {
    UndoStack,
    RedoStack,
}

/// Cheaply-cloneable handle to one peer's undo/redo manager.
#[derive(Clone)]
pub struct UndoRedo {
    inner: Rc<RefCell<UndoInner>>,
    store: OpStore,
}

impl UndoRedo {
    /// Attach a manager that records every local edit.
    #[must_use]
    pub fn attach(store: &OpStore) -> Self {
        Self::build(store, None)
    }

    /// Attach a manager that records only edits whose field key is in
    /// `fields`.
    #[must_use]
    pub fn attach_filtered(store: &OpStore, fields: impl IntoIterator<Item = NodeId>) -> Self {
        Self::build(store, Some(fields.into_iter().collect()))
    }

    fn build(store: &OpStore, filter: Option<BTreeSet<NodeId>>) -> Self {
        let inner = Rc::new(RefCell::new(UndoInner {
            filter,
            ..UndoInner::default()
        }));
        store.subscribe(Rc::new(UndoRecorder {
            inner: Rc::clone(&inner),
        }));
        Self {
            inner,
            store: store.clone(),
        }
    }

    /// Run `f` with every recorded edit collapsed into a single undo step.
    /// Batches nest; only the outermost commits.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        {
            let mut inner = self.inner.borrow_mut();
            inner.depth = inner.depth.saturating_add(1);
        }
        let result = f();
        let mut inner = self.inner.borrow_mut();
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth == 0 {
            inner.commit_pending();
        }
        result
    }

    /// Undo the most recent change group. Returns `false` (silently) when
    /// the undo stack is empty.
    pub fn undo(&self) -> bool {
        let group = self.inner.borrow_mut().undo.pop();
        match group {
            Some(group) => {
                self.replay(group, ReplayTarget::RedoStack);
                true
            }
            None => false,
        }
    }

    /// Re-apply the most recently undone group. Returns `false` (silently)
    /// when the redo stack is empty.
    pub fn redo(&self) -> bool {
        let group = self.inner.borrow_mut().redo.pop();
        match group {
            Some(group) => {
                self.replay(group, ReplayTarget::UndoStack);
                true
            }
            None => false,
        }
    }

    /// Number of undoable steps.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.inner.borrow().undo.len()
    }

    /// Number of redoable steps.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.inner.borrow().redo.len()
    }

    fn replay(&self, group: ChangeGroup, target: ReplayTarget) {
        self.inner.borrow_mut().busy = true;

        let mut inverses = ChangeGroup::with_capacity(group.len());
        for entry in &group {
            // Capture the value being overwritten so the step itself can be
            // inverted from the opposite stack.
            let current = self.store.get(&entry.entity_id, &entry.field_key);
            inverses.push(ChangeEntry {
                entity_id: entry.entity_id.clone(),
                field_key: entry.field_key.clone(),
                value: current,
            });

            let result = match entry.value {
                Some(value) => self.store.set(&entry.entity_id, &entry.field_key, value),
                None => self.store.delete(&entry.entity_id, &entry.field_key),
            };
            if let Err(err) = result {
                // Entries were recorded from accepted ops, so this path only
                // triggers on ids that were never recordable to begin with.
                tracing::warn!(%err, "skipping unreplayable undo entry");
            }
        }
        inverses.reverse();

        let mut inner = self.inner.borrow_mut();
        inner.busy = false;
        match target {
            ReplayTarget::UndoStack => inner.undo.push(inverses),
            ReplayTarget::RedoStack => inner.redo.push(inverses),
        }
    }
}

impl std::fmt::Debug for UndoRedo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("UndoRedo")
            .field("undo", &inner.undo.len())
            .field("redo", &inner.redo.len())
            .field("depth", &inner.depth)
            .field("busy", &inner.busy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::op::{Operation, PeerId};

    fn fixture() -> (OpStore, UndoRedo) {
        let store = OpStore::with_clock(PeerId::new("alpha"), ManualClock::new(1_000));
        let undo = UndoRedo::attach(&store);
        (store, undo)
    }

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn undo_restores_prior_value() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");
        store.set(&id("a"), &id("p"), 2).expect("set");

        assert!(undo.undo());
        assert_eq!(store.get(&id("a"), &id("p")), Some(1));
        assert!(undo.undo());
        assert_eq!(store.get(&id("a"), &id("p")), None);
    }

    #[test]
    fn undo_of_first_write_restores_by_tombstone() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");
        assert!(undo.undo());

        let op = store.field_op(&id("a"), &id("p")).expect("op");
        assert!(op.deleted);
        // The restore is a fresh local write: it dominates the undone op
        // rather than rewinding to its timestamp.
        assert_eq!(op.timestamp, 1_001);
    }

    #[test]
    fn empty_stacks_are_silent_no_ops() {
        let (store, undo) = fixture();
        assert!(!undo.undo());
        assert!(!undo.redo());
        assert_eq!(store.field_count(), 0);
    }

    #[test]
    fn redo_reapplies_undone_group() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");
        store.set(&id("a"), &id("p"), 2).expect("set");

        undo.undo();
        assert!(undo.redo());
        assert_eq!(store.get(&id("a"), &id("p")), Some(2));
    }

    #[test]
    fn undo_redo_round_trip_leaves_stacks_balanced() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");

        undo.undo();
        undo.redo();
        assert_eq!(undo.undo_depth(), 1);
        assert_eq!(undo.redo_depth(), 0);
        assert_eq!(store.get(&id("a"), &id("p")), Some(1));

        undo.undo();
        assert_eq!(store.get(&id("a"), &id("p")), None);
    }

    #[test]
    fn new_local_edit_clears_redo() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");
        undo.undo();
        assert_eq!(undo.redo_depth(), 1);

        store.set(&id("b"), &id("p"), 9).expect("set");
        assert_eq!(undo.redo_depth(), 0);
    }

    #[test]
    fn remote_ops_are_not_recorded() {
        let (store, undo) = fixture();
        let op = Operation::set(id("a"), id("p"), 5, PeerId::new("bravo"), 500);
        store
            .apply(op, crate::store::Origin::Remote)
            .expect("apply");

        assert_eq!(undo.undo_depth(), 0);
        assert!(!undo.undo());
        assert_eq!(store.get(&id("a"), &id("p")), Some(5));
    }

    #[test]
    fn filter_limits_recording_to_named_fields() {
        let store = OpStore::with_clock(PeerId::new("alpha"), ManualClock::new(1_000));
        let undo = UndoRedo::attach_filtered(&store, [id("p")]);

        store.set(&id("a"), &id("p"), 1).expect("set");
        store.set(&id("a"), &id("q"), 2).expect("set");

        assert!(undo.undo());
        assert_eq!(store.get(&id("a"), &id("p")), None);
        assert_eq!(store.get(&id("a"), &id("q")), Some(2));
    }

    #[test]
    fn batch_collapses_edits_into_one_step() {
        let (store, undo) = fixture();
        undo.batch(|| {
            store.set(&id("a"), &id("p"), 1).expect("set");
            store.set(&id("b"), &id("p"), 2).expect("set");
        });
        assert_eq!(undo.undo_depth(), 1);

        assert!(undo.undo());
        assert_eq!(store.get(&id("a"), &id("p")), None);
        assert_eq!(store.get(&id("b"), &id("p")), None);
    }

    #[test]
    fn nested_batches_commit_once() {
        let (store, undo) = fixture();
        undo.batch(|| {
            store.set(&id("a"), &id("p"), 1).expect("set");
            undo.batch(|| {
                store.set(&id("b"), &id("p"), 2).expect("set");
            });
            store.set(&id("c"), &id("p"), 3).expect("set");
        });

        assert_eq!(undo.undo_depth(), 1);
        undo.undo();
        for node in ["a", "b", "c"] {
            assert_eq!(store.get(&id(node), &id("p")), None);
        }
    }

    #[test]
    fn batch_returns_closure_result() {
        let (store, undo) = fixture();
        let value = undo.batch(|| {
            store.set(&id("a"), &id("p"), 1).expect("set");
            41 + 1
        });
        assert_eq!(value, 42);
    }

    #[test]
    fn batched_undo_restores_mixed_prior_values() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 10).expect("set");

        undo.batch(|| {
            store.set(&id("a"), &id("p"), 11).expect("set");
            store.set(&id("b"), &id("p"), 20).expect("set");
        });

        undo.undo();
        assert_eq!(store.get(&id("a"), &id("p")), Some(10));
        assert_eq!(store.get(&id("b"), &id("p")), None);

        undo.redo();
        assert_eq!(store.get(&id("a"), &id("p")), Some(11));
        assert_eq!(store.get(&id("b"), &id("p")), Some(20));
    }

    #[test]
    fn replay_is_not_re_recorded() {
        let (store, undo) = fixture();
        store.set(&id("a"), &id("p"), 1).expect("set");

        // Two undos in a row must not feed on each other: the replayed
        // writes are suppressed by the busy flag.
        undo.undo();
        assert_eq!(undo.undo_depth(), 0);
        assert_eq!(undo.redo_depth(), 1);
        assert!(!undo.undo());
    }
}
