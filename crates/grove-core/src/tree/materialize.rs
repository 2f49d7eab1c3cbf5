//! Edge set → rooted acyclic tree.
//!
//! The raw edge set is the free LWW composition of concurrent edits, so it
//! may encode multiple candidate parents per node and outright cycles
//! (`a.parent = b` while `b.parent = a`). Materialization derives a single
//! canonical rooted tree from it in four stages:
//!
//! 1. reset every node's parent to its preferred edge,
//! 2. classify nodes as rooted / non-rooted, detecting cycles with Floyd's
//!    tortoise-and-hare,
//! 3. reattach non-rooted nodes through a ranked ready/deferred edge queue,
//! 4. build sorted children lists.
//!
//! Every choice along the way (edge preference, tie-breaks, queue order) is
//! a total function of the edge set, so any two peers holding the same edge
//! set compute the same tree. There is no hidden state; [`materialize`] is a
//! pure function and can be called on any edge map without a live store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::error::ErrorCode;
use crate::op::NodeId;

/// Candidate parent edges per node: `child -> (parent -> counter)`.
pub type EdgeMap = BTreeMap<NodeId, BTreeMap<NodeId, i64>>;

/// The materialized `(parent, children)` relations.
///
/// Every known node appears in both maps; the root's parent is `None`.
/// Children lists are sorted ascending by id. Sibling order carries no
/// further meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    parent: BTreeMap<NodeId, Option<NodeId>>,
    children: BTreeMap<NodeId, Vec<NodeId>>,
}

impl Layout {
    /// The parent of `node`: `None` for the root or an unknown id.
    #[must_use]
    pub fn parent_of(&self, node: &NodeId) -> Option<&NodeId> {
        self.parent.get(node).and_then(Option::as_ref)
    }

    /// The sorted children of `node` (empty for leaves and unknown ids).
    #[must_use]
    pub fn children_of(&self, node: &NodeId) -> &[NodeId] {
        self.children.get(node).map_or(&[], Vec::as_slice)
    }

    /// Whether the layout knows this id.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.parent.contains_key(node)
    }

    /// All known node ids in ascending order, root included.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.parent.keys()
    }

    /// Number of known nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Whether the layout holds only the root (or nothing at all).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parent.len() <= 1
    }

    /// Whether `ancestor` appears on `node`'s parent chain.
    ///
    /// A node is not its own ancestor. The walk is bounded by the layout
    /// size; a materialized layout has no cycles to begin with.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &NodeId, node: &NodeId) -> bool {
        let mut current = self.parent_of(node);
        let mut remaining = self.parent.len();
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            if remaining == 0 {
                break;
            }
            remaining -= 1;
            current = self.parent_of(candidate);
        }
        false
    }
}

/// The preferred edge of a node: highest counter, ties broken by larger
/// parent id. `None` when the node has no candidate edges.
#[must_use]
pub fn preferred_edge(edges: &BTreeMap<NodeId, i64>) -> Option<&NodeId> {
    edges
        .iter()
        .max_by_key(|(parent, counter)| (**counter, (*parent).clone()))
        .map(|(parent, _)| parent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rootedness {
    Rooted,
    NonRooted,
}

/// A reattachment candidate, ranked for the ready queue.
///
/// The queue pops the edge with the largest counter first; ties prefer the
/// smaller parent id, then the smaller child id. `Ord` is written so the
/// max-heap surfaces exactly that edge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RankedEdge {
    counter: i64,
    parent: NodeId,
    child: NodeId,
}

impl Ord for RankedEdge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| other.parent.cmp(&self.parent))
            .then_with(|| other.child.cmp(&self.child))
    }
}

impl PartialOrd for RankedEdge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Derive the canonical rooted tree from a candidate edge set.
///
/// The resulting layout covers the root, every key of `edges`, and every id
/// mentioned as a candidate parent. All nodes end up reachable from the
/// root: nodes whose parent chain reaches the root keep their preferred
/// edge; members of cycles (and chains into cycles) are reattached through
/// the ranked ready queue; anything left, meaning a node with no usable edge
/// at all, falls back to sitting directly under the root.
#[must_use]
pub fn materialize(edges: &EdgeMap) -> Layout {
    let root = NodeId::root();

    // Universe: every id seen as child or candidate parent, plus the root.
    let mut universe: BTreeSet<NodeId> = edges.keys().cloned().collect();
    for candidates in edges.values() {
        universe.extend(candidates.keys().cloned());
    }
    universe.insert(root.clone());

    // Stage 1: reset every parent pointer to the preferred edge.
    let mut parent: BTreeMap<NodeId, Option<NodeId>> = BTreeMap::new();
    for node in &universe {
        let preferred = if node.is_root() {
            None
        } else {
            edges
                .get(node)
                .and_then(|candidates| preferred_edge(candidates).cloned())
        };
        parent.insert(node.clone(), preferred);
    }

    // Stage 2: classify rooted vs non-rooted.
    let mut state: BTreeMap<NodeId, Rootedness> = BTreeMap::new();
    state.insert(root.clone(), Rootedness::Rooted);
    for node in &universe {
        if state.contains_key(node) {
            continue;
        }
        let rooted = chain_reaches_root(node, &parent, &state);
        mark_chain(node, rooted, &parent, &mut state);
    }

    // Stage 3: reattach non-rooted nodes deterministically.
    let mut non_rooted: BTreeSet<NodeId> = state
        .iter()
        .filter(|(_, rootedness)| **rootedness == Rootedness::NonRooted)
        .map(|(node, _)| node.clone())
        .collect();

    let mut ready: BinaryHeap<RankedEdge> = BinaryHeap::new();
    let mut deferred: BTreeMap<NodeId, Vec<RankedEdge>> = BTreeMap::new();
    for child in &non_rooted {
        let Some(candidates) = edges.get(child) else {
            continue;
        };
        for (candidate_parent, counter) in candidates {
            let edge = RankedEdge {
                counter: *counter,
                parent: candidate_parent.clone(),
                child: child.clone(),
            };
            if state.get(candidate_parent) == Some(&Rootedness::Rooted) {
                ready.push(edge);
            } else {
                deferred.entry(candidate_parent.clone()).or_default().push(edge);
            }
        }
    }

    while let Some(edge) = ready.pop() {
        if !non_rooted.remove(&edge.child) {
            // Already attached through a better-ranked edge.
            continue;
        }
        parent.insert(edge.child.clone(), Some(edge.parent));
        state.insert(edge.child.clone(), Rootedness::Rooted);
        if let Some(promoted) = deferred.remove(&edge.child) {
            for waiting in promoted {
                ready.push(waiting);
            }
        }
    }

    // Fallback: whatever the queue could not reach sits directly under the
    // root, in ascending id order. This sweep is terminal and must not
    // promote deferred edges, otherwise one member of a two-cycle would end
    // up chained under the other instead of both landing under the root.
    for orphan in &non_rooted {
        parent.insert(orphan.clone(), Some(root.clone()));
    }

    // Stage 4: children lists, sorted by id.
    let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for node in &universe {
        children.entry(node.clone()).or_default();
    }
    for (node, maybe_parent) in &parent {
        if let Some(p) = maybe_parent {
            children.entry(p.clone()).or_default().push(node.clone());
        }
    }
    for siblings in children.values_mut() {
        siblings.sort();
    }

    Layout { parent, children }
}

/// One probe step along the parent chain.
enum Probe {
    Rooted,
    NonRooted,
    Next(NodeId),
}

fn probe(
    node: &NodeId,
    parent: &BTreeMap<NodeId, Option<NodeId>>,
    state: &BTreeMap<NodeId, Rootedness>,
) -> Probe {
    match parent.get(node).and_then(Option::as_ref) {
        // Dead end: the chain stops short of the root.
        None => Probe::NonRooted,
        Some(next) if next.is_root() => Probe::Rooted,
        Some(next) => match state.get(next) {
            Some(Rootedness::Rooted) => Probe::Rooted,
            Some(Rootedness::NonRooted) => Probe::NonRooted,
            None => Probe::Next(next.clone()),
        },
    }
}

/// Follow the parent chain from `start`, returning whether it reaches the
/// root. Floyd's tortoise-and-hare bounds the walk: if the chain loops, the
/// hare laps the tortoise before either reaches a terminal, and the chain is
/// declared non-rooted. A naive walk would spin forever on such input.
fn chain_reaches_root(
    start: &NodeId,
    parent: &BTreeMap<NodeId, Option<NodeId>>,
    state: &BTreeMap<NodeId, Rootedness>,
) -> bool {
    let mut tortoise = start.clone();
    let mut hare = start.clone();

    loop {
        for _ in 0..2 {
            match probe(&hare, parent, state) {
                Probe::Rooted => return true,
                Probe::NonRooted => return false,
                Probe::Next(next) => hare = next,
            }
        }

        match parent.get(&tortoise).and_then(Option::as_ref) {
            Some(next) => tortoise = next.clone(),
            // Unreachable: the hare already stepped through this node.
            None => return false,
        }

        if hare == tortoise {
            tracing::debug!(
                code = %ErrorCode::CycleDetected,
                node = %start,
                "candidate parent chain loops; members will be reattached"
            );
            return false;
        }
    }
}

/// Mark every node on the chain from `start` with the walk's outcome, up to
/// the first terminal or already-classified node. In the cycle case the walk
/// revisits its own freshly-marked entry point and stops there.
fn mark_chain(
    start: &NodeId,
    rooted: bool,
    parent: &BTreeMap<NodeId, Option<NodeId>>,
    state: &mut BTreeMap<NodeId, Rootedness>,
) {
    let mark = if rooted {
        Rootedness::Rooted
    } else {
        Rootedness::NonRooted
    };

    let mut current = start.clone();
    loop {
        if state.contains_key(&current) {
            break;
        }
        state.insert(current.clone(), mark);
        match parent.get(&current).and_then(Option::as_ref) {
            Some(next) => current = next.clone(),
            None => break,
        }
    }
}
