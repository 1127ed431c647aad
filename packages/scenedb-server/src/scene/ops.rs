//! Scene operations.
//!
//! `SceneOp` is the command vocabulary of the state machine: the eight
//! client-visible tree/property operations plus the four migration
//! primitives a `move_shard` decomposes into. Migration primitives are
//! synthesized by the transaction coordinator and never submitted directly
//! by clients.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scene::node::{NodeId, SceneNode};

/// One property write inside a `BatchUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub node: NodeId,
    pub key: String,
    pub value: String,
}

/// A single deterministic mutation of the scene tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SceneOp {
    /// Install `new_node` as the new first child of `target`, pushing the
    /// former first child to `new_node.right_sibling`. With `target = None`
    /// this creates a standalone node (root creation).
    AddChild {
        target: Option<NodeId>,
        new_node: NodeId,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },

    /// Splice `new_node` immediately after `target` in its sibling chain.
    AddSibling {
        target: NodeId,
        new_node: NodeId,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },

    /// Delete `node` and its whole subtree.
    RemoveNode { node: NodeId },

    /// Upsert `key -> value` on `node`.
    SetProperty {
        node: NodeId,
        key: String,
        value: String,
    },

    /// Detach `node` from its current position and re-attach it under
    /// `new_parent`: after `new_sibling` when given, else as first child.
    MoveSubtree {
        node: NodeId,
        new_parent: NodeId,
        new_sibling: Option<NodeId>,
    },

    /// Reposition `child_node` to `to_index` among `parent`'s ordered
    /// children. Negative indices count from the end; an out-of-range index
    /// or a non-child is a no-op.
    MoveChild {
        parent: NodeId,
        child_node: NodeId,
        to_index: i64,
    },

    /// Apply each update in order as a `SetProperty`; atomic at log-entry
    /// granularity.
    BatchUpdate { updates: Vec<PropertyUpdate> },

    /// Apply each structural op in order; invalid nested ops are no-ops.
    BatchStructure { structure_ops: Vec<SceneOp> },

    // ── Migration primitives (coordinator-synthesized) ─────────────────

    /// Install `state` for `node` wholesale on the destination shard. Also
    /// moves the node's placement to the entry's shard.
    StateTransfer { node: NodeId, state: SceneNode },

    /// Drop the local record of `node` on a shard that no longer hosts it.
    ShardRemove { node: NodeId },

    /// Clear the one pointer that links `child` into `parent`'s child chain.
    DetachChild { parent: NodeId, child: NodeId },

    /// Re-link `child` at `position` among `new_parent`'s children. With
    /// `new_parent = None` the transferred node stays a root and no pointer
    /// is rewritten.
    AttachChild {
        new_parent: Option<NodeId>,
        child: NodeId,
        position: u32,
    },
}

impl SceneOp {
    /// The node this operation is routed by: the coordinator assigns the op
    /// to the shard hosting this node. Batches route by their first
    /// referenced node; `AddChild` routes by its target (placement of the
    /// created node follows the shard that carried the entry).
    pub fn primary_node(&self) -> Option<NodeId> {
        match self {
            SceneOp::AddChild { target, new_node, .. } => Some(target.unwrap_or(*new_node)),
            SceneOp::AddSibling { target, .. } => Some(*target),
            SceneOp::RemoveNode { node } => Some(*node),
            SceneOp::SetProperty { node, .. } => Some(*node),
            SceneOp::MoveSubtree { node, .. } => Some(*node),
            SceneOp::MoveChild { parent, .. } => Some(*parent),
            SceneOp::BatchUpdate { updates } => updates.first().map(|u| u.node),
            SceneOp::BatchStructure { structure_ops } => {
                structure_ops.first().and_then(|op| op.primary_node())
            }
            SceneOp::StateTransfer { node, .. } => Some(*node),
            SceneOp::ShardRemove { node } => Some(*node),
            SceneOp::DetachChild { child, .. } => Some(*child),
            SceneOp::AttachChild { child, .. } => Some(*child),
        }
    }

    /// True for client-visible operations; migration primitives are only
    /// valid inside a coordinator-synthesized transaction.
    pub fn is_client_op(&self) -> bool {
        !matches!(
            self,
            SceneOp::StateTransfer { .. }
                | SceneOp::ShardRemove { .. }
                | SceneOp::DetachChild { .. }
                | SceneOp::AttachChild { .. }
        )
    }
}
