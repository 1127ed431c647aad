//! Error types for the scene-graph store

use thiserror::Error;

use crate::scene::NodeId;
use crate::shard::ShardId;

pub type Result<T> = std::result::Result<T, SceneError>;

#[derive(Error, Debug)]
pub enum SceneError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node already exists: {0}")]
    NodeExists(NodeId),

    #[error("Node id {0} outside configured id space")]
    NodeIdOutOfRange(NodeId),

    #[error("Rejected operation: {0}")]
    RejectedOp(String),

    #[error("Unknown shard: {0}")]
    UnknownShard(ShardId),

    #[error("Not leader for shard {shard}; current leader is replica {leader}")]
    NotLeader { shard: ShardId, leader: usize },

    #[error("No leader available for shard {0}")]
    NoLeader(ShardId),

    #[error("Log index {index} not committed on shard {shard}")]
    IndexNotCommitted { shard: ShardId, index: u64 },

    #[error("Transaction {0} not found")]
    TxnNotFound(u64),

    #[error("Replica {0} is crashed")]
    ReplicaCrashed(usize),

    #[error("Unknown replica: {0}")]
    UnknownReplica(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid wire format: {0}")]
    InvalidFormat(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Fatal: the local tree no longer satisfies LCRS validity. The replica
    // halts rather than diverging.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl SceneError {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            SceneError::NodeNotFound(_) => "NODE_NOT_FOUND",
            SceneError::NodeExists(_) => "NODE_EXISTS",
            SceneError::NodeIdOutOfRange(_) => "NODE_ID_OUT_OF_RANGE",
            SceneError::RejectedOp(_) => "REJECTED_OP",
            SceneError::UnknownShard(_) => "UNKNOWN_SHARD",
            SceneError::NotLeader { .. } => "NOT_LEADER",
            SceneError::NoLeader(_) => "NO_LEADER",
            SceneError::TxnNotFound(_) => "TXN_NOT_FOUND",
            SceneError::ReplicaCrashed(_) => "REPLICA_CRASHED",
            SceneError::UnknownReplica(_) => "UNKNOWN_REPLICA",
            SceneError::InvalidFormat(_) => "INVALID_FORMAT",
            SceneError::InvalidConfig(_) => "INVALID_CONFIG",
            SceneError::InvariantViolation(_) => "INVARIANT_VIOLATION",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True for input errors that abort the enclosing transaction without
    /// mutating state (as opposed to infrastructure failures).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SceneError::NodeNotFound(_)
                | SceneError::NodeExists(_)
                | SceneError::NodeIdOutOfRange(_)
                | SceneError::RejectedOp(_)
        )
    }
}
