#![forbid(unsafe_code)]
//! grove-core: a replicated, offline-first hierarchical tree CRDT.
//!
//! Peers exchange per-field LWW operations that form a raw, possibly cyclic
//! parent relation; every peer deterministically materializes the same
//! rooted, acyclic tree from it. Three components compose leaf-first:
//!
//! - [`OpStore`]: one LWW register per `(entity_id, field_key)`, merged
//!   under the `(timestamp, peer_id)` total order, with synchronous observer
//!   fan-out.
//! - [`Tree`]: an observer that folds the registers into a candidate edge
//!   set and re-materializes a canonical rooted tree after every op.
//! - [`UndoRedo`]: an observer that records inverse values for local edits
//!   and replays them through the normal write path.
//!
//! [`Peer`] wires the three together with an outbound sink; `grove-sim`
//! drives fleets of peers through a fault-injecting network to check
//! convergence.
//!
//! # Conventions
//!
//! - **Errors**: rejection happens at the `apply` boundary via [`OpError`];
//!   everything past validation is infallible and auto-creates unknown ids.
//! - **Logging**: `tracing` macros, observability only; cycles and losing
//!   writes are logged, never turned into control flow.
//! - **Determinism**: `BTreeMap`/`BTreeSet` everywhere state is iterated;
//!   any two peers holding the same ops compute byte-identical state.

pub mod clock;
pub mod error;
pub mod op;
pub mod peer;
pub mod store;
pub mod tree;
pub mod undo;

pub use clock::{ManualClock, TimeSource, WallClock};
pub use error::{ErrorCode, OpError};
pub use op::{NodeId, Operation, PeerId, ROOT_ID};
pub use peer::Peer;
pub use store::{FieldKey, OpNotice, OpStore, Origin, StoreObserver};
pub use tree::{materialize, preferred_edge, EdgeMap, Layout, Tree};
pub use undo::{ChangeEntry, ChangeGroup, UndoRedo};
