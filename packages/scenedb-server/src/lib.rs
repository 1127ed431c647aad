//! SceneDB: replicated, sharded scene-graph store.
//!
//! Clients submit scene operations (tree edits and property writes)
//! against a logical left-child/right-sibling tree. Operations replicate
//! through per-shard consensus logs, concurrent work is ordered by hybrid
//! logical clocks, and cross-shard transactions commit with a parallel
//! protocol that needs no second coordinator round trip when nothing
//! conflicts.
//!
//! The three load-bearing pieces:
//! - [`scene::SceneState`]: the deterministic tree state machine;
//! - [`txn::coordinator`]: parallel commit with HLC conflict detection;
//! - [`applier`] + [`recovery`]: per-shard apply loops and crash replay.
//!
//! [`cluster::ClusterStore`] wires shard logs and replicas into one store
//! and carries the client surface (`submit`, `get`, `ordered_children`,
//! `move_shard`, crash/recover).

pub mod applier;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod error;
pub mod hlc;
pub mod metrics;
pub mod recovery;
pub mod scene;
pub mod session;
pub mod shard;
pub mod txn;

pub use cluster::{ClusterStore, NodeView};
pub use config::ClusterConfig;
pub use error::{Result, SceneError};
pub use hlc::HlcTimestamp;
pub use scene::{NodeId, PropertyUpdate, SceneNode, SceneOp, SceneState};
pub use shard::{ShardId, ShardMap};
pub use txn::coordinator::TxnOutcome;
pub use txn::{AbortReason, TxnStatus};
