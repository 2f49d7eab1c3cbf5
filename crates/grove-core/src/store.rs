//! Per-field LWW register store.
//!
//! The store keeps exactly one winning [`Operation`] per
//! `(entity_id, field_key)` register and merges incoming operations under the
//! `(timestamp, peer_id)` total order. Local writes go through [`OpStore::set`]
//! and [`OpStore::delete`], which stamp the operation with
//! `max(now, existing.timestamp + 1)` so a local write always dominates the
//! field it targets. Remote operations enter through [`OpStore::apply`] with
//! [`Origin::Remote`] in any order; duplicate and out-of-order delivery are
//! harmless because a merge installs the incoming op only when it is strictly
//! greater than the stored one.
//!
//! # Observers
//!
//! Observers fire synchronously, in registration order, after the field is
//! written. The notice carries the *incoming* op (not the resulting state)
//! plus the prior visible value, and fires even when the incoming op lost the
//! comparison. Losing notifications matter: the tree must know which edge a
//! write referred to so it can fold node creation out of any op that mentions
//! an id.
//!
//! Dispatch iterates a snapshot of the observer list and holds no store
//! borrow across callbacks, so an observer may read the store or issue
//! further writes; those writes surface as nested `apply` calls. An observer
//! that writes from inside its own callback must guard against re-entrant
//! notification itself (the undo manager's busy flag is the canonical
//! pattern).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::clock::{TimeSource, WallClock};
use crate::error::OpError;
use crate::op::{NodeId, Operation, PeerId};

/// Register address: `(entity_id, field_key)`.
pub type FieldKey = (NodeId, NodeId);

/// Where an operation entered this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this peer's own edit path.
    Local,
    /// Delivered from another peer.
    Remote,
}

/// What observers receive for every applied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpNotice {
    /// The incoming operation, win or lose.
    pub op: Operation,
    /// Whether the op was produced locally or delivered from a peer.
    pub origin: Origin,
    /// The field's visible value before this apply. `None` when the field
    /// was absent or tombstoned.
    pub old_value: Option<i64>,
}

/// Observer registered with [`OpStore::subscribe`].
///
/// Methods take `&self`: each observer owns its interior mutability, which is
/// what lets nested `apply` calls re-enter the dispatch loop without holding
/// anyone else's borrow.
pub trait StoreObserver {
    /// Called once per applied operation, after the field is written.
    fn on_op(&self, store: &OpStore, notice: &OpNotice);
}

struct StoreInner {
    peer_id: PeerId,
    clock: Box<dyn TimeSource>,
    fields: BTreeMap<FieldKey, Operation>,
    observers: Vec<Rc<dyn StoreObserver>>,
}

/// Cheaply-cloneable handle to one peer's LWW register store.
///
/// The core is single-threaded cooperative: all components of one peer share
/// this handle and run on one logical task.
#[derive(Clone)]
pub struct OpStore {
    inner: Rc<RefCell<StoreInner>>,
}

impl OpStore {
    /// Create a store stamping local ops from the real wall clock.
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self::with_clock(peer_id, WallClock)
    }

    /// Create a store with an injected time source (tests, simulation).
    #[must_use]
    pub fn with_clock(peer_id: PeerId, clock: impl TimeSource + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                peer_id,
                clock: Box::new(clock),
                fields: BTreeMap::new(),
                observers: Vec::new(),
            })),
        }
    }

    /// This peer's identifier.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.borrow().peer_id.clone()
    }

    /// Register an observer. Observers fire in registration order.
    pub fn subscribe(&self, observer: Rc<dyn StoreObserver>) {
        self.inner.borrow_mut().observers.push(observer);
    }

    /// The current visible value of a field: `None` when the field is absent
    /// or tombstoned.
    #[must_use]
    pub fn get(&self, entity_id: &NodeId, field_key: &NodeId) -> Option<i64> {
        self.inner
            .borrow()
            .fields
            .get(&(entity_id.clone(), field_key.clone()))
            .and_then(Operation::visible_value)
    }

    /// The winning operation currently stored for a field, tombstones
    /// included.
    #[must_use]
    pub fn field_op(&self, entity_id: &NodeId, field_key: &NodeId) -> Option<Operation> {
        self.inner
            .borrow()
            .fields
            .get(&(entity_id.clone(), field_key.clone()))
            .cloned()
    }

    /// Snapshot of every field's winning op, in key order.
    ///
    /// Replaying this snapshot (or any superset of the op log) into an empty
    /// store through [`OpStore::apply`] reconstructs the same field state;
    /// that is the whole persistence contract.
    #[must_use]
    pub fn ops(&self) -> Vec<Operation> {
        self.inner.borrow().fields.values().cloned().collect()
    }

    /// Number of registers with a stored op (tombstoned fields included).
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.inner.borrow().fields.len()
    }

    /// Write a value locally.
    ///
    /// The timestamp advances to `max(now, existing.timestamp + 1)`, so the
    /// write dominates whatever the field currently holds.
    ///
    /// # Errors
    ///
    /// [`OpError::RootMutation`] when `entity_id` is the root,
    /// [`OpError::InvalidOp`] when an id is empty.
    pub fn set(&self, entity_id: &NodeId, field_key: &NodeId, value: i64) -> Result<(), OpError> {
        if entity_id.is_root() {
            return Err(OpError::RootMutation(field_key.clone()));
        }
        let op = self.stamp(entity_id, field_key, Some(value));
        self.apply(op, Origin::Local).map(|_| ())
    }

    /// Tombstone a field locally, with the same timestamp discipline as
    /// [`OpStore::set`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`OpStore::set`].
    pub fn delete(&self, entity_id: &NodeId, field_key: &NodeId) -> Result<(), OpError> {
        if entity_id.is_root() {
            return Err(OpError::RootMutation(field_key.clone()));
        }
        let op = self.stamp(entity_id, field_key, None);
        self.apply(op, Origin::Local).map(|_| ())
    }

    /// Merge one operation into field state and notify observers.
    ///
    /// Returns whether the op was installed (strictly greater than the stored
    /// op, or the field was empty).
    ///
    /// # Errors
    ///
    /// [`OpError::InvalidOp`] for ops with empty ids, an empty peer, or an
    /// inconsistent `value`/`deleted` pair; [`OpError::RootMutation`] when the
    /// entity is the root. Rejection happens before any state change.
    pub fn apply(&self, op: Operation, origin: Origin) -> Result<bool, OpError> {
        validate(&op)?;

        let (installed, old_value) = {
            let mut inner = self.inner.borrow_mut();
            let key = (op.entity_id.clone(), op.field_key.clone());
            let old_value = inner.fields.get(&key).and_then(Operation::visible_value);
            let installed = match inner.fields.get(&key) {
                Some(existing) => op.wins_over(existing),
                None => true,
            };
            if installed {
                inner.fields.insert(key, op.clone());
            }
            (installed, old_value)
        };

        if !installed {
            tracing::trace!(op = %op, ?origin, "op lost LWW comparison; field unchanged");
        }

        let notice = OpNotice {
            op,
            origin,
            old_value,
        };
        let observers = self.inner.borrow().observers.clone();
        for observer in &observers {
            observer.on_op(self, &notice);
        }

        Ok(installed)
    }

    fn stamp(&self, entity_id: &NodeId, field_key: &NodeId, value: Option<i64>) -> Operation {
        let mut inner = self.inner.borrow_mut();
        let now = inner.clock.now_millis();
        let key = (entity_id.clone(), field_key.clone());
        let timestamp = match inner.fields.get(&key) {
            Some(existing) => now.max(existing.timestamp.saturating_add(1)),
            None => now,
        };
        let peer_id = inner.peer_id.clone();
        match value {
            Some(v) => Operation::set(entity_id.clone(), field_key.clone(), v, peer_id, timestamp),
            None => Operation::tombstone(entity_id.clone(), field_key.clone(), peer_id, timestamp),
        }
    }
}

impl std::fmt::Debug for OpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("OpStore")
            .field("peer_id", &inner.peer_id)
            .field("fields", &inner.fields.len())
            .field("observers", &inner.observers.len())
            .finish()
    }
}

fn validate(op: &Operation) -> Result<(), OpError> {
    if op.entity_id.is_empty() {
        return Err(OpError::InvalidOp("empty entity_id".to_string()));
    }
    if op.field_key.is_empty() {
        return Err(OpError::InvalidOp("empty field_key".to_string()));
    }
    if op.peer_id.is_empty() {
        return Err(OpError::InvalidOp("empty peer_id".to_string()));
    }
    if op.value.is_some() && op.deleted {
        return Err(OpError::InvalidOp(
            "value and deleted are mutually exclusive".to_string(),
        ));
    }
    if op.value.is_none() && !op.deleted {
        return Err(OpError::InvalidOp(
            "one of value or deleted must be present".to_string(),
        ));
    }
    if op.entity_id.is_root() {
        // A remote op naming the root is malformed outright; the local
        // write path reports RootMutation before stamping.
        return Err(OpError::InvalidOp(
            "the root cannot be the entity of an operation".to_string(),
        ));
    }
    Ok(())
}
