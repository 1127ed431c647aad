//! Deterministic scene-tree state machine.
//!
//! `SceneState` is the single source of truth for tree shape and properties
//! on a replica. It holds an arena of node slots indexed by `NodeId` and
//! applies one `SceneOp` at a time; given the same operation sequence every
//! replica reaches the same state. Traversals (`descendants`,
//! `ordered_children`) use explicit work lists rather than recursion so the
//! descendant closure is cheap to reuse from the conflict detector.
//!
//! Mutation happens only through `apply`, driven by the per-shard applier
//! loop; reads are served from the same arena.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::error::{Result, SceneError};
use crate::scene::node::{NodeId, SceneNode};
use crate::scene::ops::SceneOp;

/// One arena slot. Nodes hosted elsewhere (or deleted) are `Vacant`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NodeSlot {
    #[default]
    Vacant,
    Live(SceneNode),
}

/// Which pointer field of a node references another node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pointer {
    LeftChild,
    RightSibling,
}

/// Arena-backed scene tree for one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneState {
    /// Slot `i` holds node id `i`; slot 0 is permanently vacant (NULL).
    slots: Vec<NodeSlot>,
    live: usize,
}

impl SceneState {
    /// Empty state over the id space `1..=max_node_id`.
    pub fn new(max_node_id: NodeId) -> Self {
        Self {
            slots: vec![NodeSlot::Vacant; max_node_id as usize + 1],
            live: 0,
        }
    }

    #[inline]
    fn in_range(&self, id: NodeId) -> bool {
        id >= 1 && (id as usize) < self.slots.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&SceneNode> {
        match self.slots.get(id as usize) {
            Some(NodeSlot::Live(node)) => Some(node),
            _ => None,
        }
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        match self.slots.get_mut(id as usize) {
            Some(NodeSlot::Live(node)) => Some(node),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ids of all live nodes, ascending.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            matches!(slot, NodeSlot::Live(_)).then_some(id as NodeId)
        })
    }

    fn require(&self, id: NodeId) -> Result<&SceneNode> {
        self.get(id).ok_or(SceneError::NodeNotFound(id))
    }

    /// Insert a fresh node. Fails on reused or out-of-range ids.
    fn insert(&mut self, id: NodeId, node: SceneNode) -> Result<()> {
        if !self.in_range(id) {
            return Err(SceneError::NodeIdOutOfRange(id));
        }
        if self.contains(id) {
            return Err(SceneError::NodeExists(id));
        }
        self.slots[id as usize] = NodeSlot::Live(node);
        self.live += 1;
        Ok(())
    }

    /// Install a node record wholesale, replacing whatever the slot held.
    /// This is the authoritative representation after a state transfer.
    pub fn install(&mut self, id: NodeId, node: SceneNode) -> Result<()> {
        if !self.in_range(id) {
            return Err(SceneError::NodeIdOutOfRange(id));
        }
        if !self.contains(id) {
            self.live += 1;
        }
        self.slots[id as usize] = NodeSlot::Live(node);
        Ok(())
    }

    fn clear_slot(&mut self, id: NodeId) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if matches!(slot, NodeSlot::Live(_)) {
                self.live -= 1;
            }
            *slot = NodeSlot::Vacant;
        }
    }

    // ── Traversals ─────────────────────────────────────────────────────

    /// The ordered children of `parent`: follow `left_child`, then chain
    /// `right_sibling`. The walk tolerates pointers to locally-absent nodes
    /// (a replica hosting a subset of shards sees truncated chains) and
    /// errors out on a cycle instead of looping.
    pub fn ordered_children(&self, parent: NodeId) -> Result<Vec<NodeId>> {
        let parent_node = self.require(parent)?;
        let mut out = Vec::new();
        let mut cursor = parent_node.left_child;
        while let Some(id) = cursor {
            if out.len() > self.slots.len() {
                return Err(SceneError::InvariantViolation(format!(
                    "sibling chain cycle under node {}",
                    parent
                )));
            }
            match self.get(id) {
                Some(node) => {
                    out.push(id);
                    cursor = node.right_sibling;
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// The descendant closure of `node`: the node itself plus everything
    /// reachable from its `left_child` through `left_child`/`right_sibling`.
    /// The node's own `right_sibling` is not a descendant.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut result = Vec::new();
        let Some(record) = self.get(node) else {
            return result;
        };
        result.push(node);
        let mut visited: HashSet<NodeId> = HashSet::from([node]);
        let mut work: Vec<NodeId> = record.left_child.into_iter().collect();
        while let Some(id) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(n) = self.get(id) {
                result.push(id);
                if let Some(lc) = n.left_child {
                    work.push(lc);
                }
                if let Some(rs) = n.right_sibling {
                    work.push(rs);
                }
            }
        }
        result
    }

    /// The unique live node referencing `node`, with the pointer field that
    /// does so. Roots have no referencer.
    fn referencer(&self, node: NodeId) -> Option<(NodeId, Pointer)> {
        for id in self.live_nodes() {
            let n = self.get(id).unwrap();
            if n.left_child == Some(node) {
                return Some((id, Pointer::LeftChild));
            }
            if n.right_sibling == Some(node) {
                return Some((id, Pointer::RightSibling));
            }
        }
        None
    }

    fn set_pointer(&mut self, id: NodeId, pointer: Pointer, value: Option<NodeId>) {
        if let Some(node) = self.get_mut(id) {
            match pointer {
                Pointer::LeftChild => node.left_child = value,
                Pointer::RightSibling => node.right_sibling = value,
            }
        }
    }

    /// The parent of `node` and the node's index among that parent's
    /// ordered children. `None` for roots and unknown nodes.
    pub fn parent_of(&self, node: NodeId) -> Option<(NodeId, usize)> {
        for candidate in self.live_nodes() {
            if candidate == node {
                continue;
            }
            if let Ok(children) = self.ordered_children(candidate) {
                if let Some(index) = children.iter().position(|&c| c == node) {
                    return Some((candidate, index));
                }
            }
        }
        None
    }

    /// Live nodes referenced by no other node.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut referenced: HashSet<NodeId> = HashSet::new();
        for id in self.live_nodes() {
            let n = self.get(id).unwrap();
            referenced.extend(n.left_child);
            referenced.extend(n.right_sibling);
        }
        self.live_nodes().filter(|id| !referenced.contains(id)).collect()
    }

    /// Rewrite `parent.left_child` and the involved `right_sibling` links so
    /// the child chain matches `order` exactly.
    fn relink_children(&mut self, parent: NodeId, order: &[NodeId]) {
        self.set_pointer(parent, Pointer::LeftChild, order.first().copied());
        for pair in order.windows(2) {
            self.set_pointer(pair[0], Pointer::RightSibling, Some(pair[1]));
        }
        if let Some(&last) = order.last() {
            self.set_pointer(last, Pointer::RightSibling, None);
        }
    }

    // ── Application ────────────────────────────────────────────────────

    /// Apply one operation. Errors for which [`SceneError::is_rejection`]
    /// holds leave the state untouched and abort the enclosing transaction;
    /// an `InvariantViolation` is fatal to the replica.
    pub fn apply(&mut self, op: &SceneOp) -> Result<()> {
        match op {
            SceneOp::AddChild {
                target,
                new_node,
                properties,
            } => self.apply_add_child(*target, *new_node, properties.clone()),
            SceneOp::AddSibling {
                target,
                new_node,
                properties,
            } => self.apply_add_sibling(*target, *new_node, properties.clone()),
            SceneOp::RemoveNode { node } => self.apply_remove_node(*node),
            SceneOp::SetProperty { node, key, value } => {
                let record = self
                    .get_mut(*node)
                    .ok_or(SceneError::NodeNotFound(*node))?;
                record.properties.insert(key.clone(), value.clone());
                Ok(())
            }
            SceneOp::MoveSubtree {
                node,
                new_parent,
                new_sibling,
            } => self.apply_move_subtree(*node, *new_parent, *new_sibling),
            SceneOp::MoveChild {
                parent,
                child_node,
                to_index,
            } => self.apply_move_child(*parent, *child_node, *to_index),
            SceneOp::BatchUpdate { updates } => {
                for update in updates {
                    if !self.contains(update.node) {
                        return Err(SceneError::NodeNotFound(update.node));
                    }
                }
                for update in updates {
                    let record = self.get_mut(update.node).unwrap();
                    record
                        .properties
                        .insert(update.key.clone(), update.value.clone());
                }
                Ok(())
            }
            SceneOp::BatchStructure { structure_ops } => {
                for nested in structure_ops {
                    match self.apply(nested) {
                        Ok(()) => {}
                        Err(err) if err.is_rejection() => {
                            debug!(error = %err, "skipping invalid op inside batch_structure");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }
            SceneOp::StateTransfer { node, state } => self.install(*node, state.clone()),
            SceneOp::ShardRemove { node } => {
                self.clear_slot(*node);
                Ok(())
            }
            SceneOp::DetachChild { parent, child } => self.apply_detach_child(*parent, *child),
            SceneOp::AttachChild {
                new_parent,
                child,
                position,
            } => self.apply_attach_child(*new_parent, *child, *position),
        }
    }

    fn apply_add_child(
        &mut self,
        target: Option<NodeId>,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    ) -> Result<()> {
        match target {
            None => self.insert(new_node, SceneNode::with_properties(properties)),
            Some(t) => {
                self.require(t)?;
                if !self.in_range(new_node) {
                    return Err(SceneError::NodeIdOutOfRange(new_node));
                }
                if self.contains(new_node) {
                    return Err(SceneError::NodeExists(new_node));
                }
                let former_first = self.get(t).unwrap().left_child;
                let mut node = SceneNode::with_properties(properties);
                node.right_sibling = former_first;
                self.insert(new_node, node)?;
                self.set_pointer(t, Pointer::LeftChild, Some(new_node));
                Ok(())
            }
        }
    }

    fn apply_add_sibling(
        &mut self,
        target: NodeId,
        new_node: NodeId,
        properties: BTreeMap<String, String>,
    ) -> Result<()> {
        self.require(target)?;
        if !self.in_range(new_node) {
            return Err(SceneError::NodeIdOutOfRange(new_node));
        }
        if self.contains(new_node) {
            return Err(SceneError::NodeExists(new_node));
        }
        let following = self.get(target).unwrap().right_sibling;
        let mut node = SceneNode::with_properties(properties);
        node.right_sibling = following;
        self.insert(new_node, node)?;
        self.set_pointer(target, Pointer::RightSibling, Some(new_node));
        Ok(())
    }

    fn apply_remove_node(&mut self, node: NodeId) -> Result<()> {
        self.require(node)?;
        let removed: HashSet<NodeId> = self.descendants(node).into_iter().collect();

        // Splice the unique referencing pointer past the removed node so the
        // trailing sibling chain stays attached. The node's own right
        // sibling is never part of the removed closure.
        let following = self.get(node).unwrap().right_sibling;
        if let Some((ref_id, pointer)) = self.referencer(node) {
            if !removed.contains(&ref_id) {
                self.set_pointer(ref_id, pointer, following);
            }
        }

        for &id in &removed {
            self.clear_slot(id);
        }

        // Clear any surviving pointer into the removed set.
        let survivors: Vec<NodeId> = self.live_nodes().collect();
        for id in survivors {
            let n = self.get(id).unwrap();
            let lc = n.left_child;
            let rs = n.right_sibling;
            if lc.is_some_and(|t| removed.contains(&t)) {
                self.set_pointer(id, Pointer::LeftChild, None);
            }
            if rs.is_some_and(|t| removed.contains(&t)) {
                self.set_pointer(id, Pointer::RightSibling, None);
            }
        }
        Ok(())
    }

    fn apply_move_subtree(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        new_sibling: Option<NodeId>,
    ) -> Result<()> {
        self.require(node)?;
        self.require(new_parent)?;
        let moved: HashSet<NodeId> = self.descendants(node).into_iter().collect();
        if moved.contains(&new_parent) {
            return Err(SceneError::RejectedOp(format!(
                "move_subtree destination {} lies inside the moved subtree of {}",
                new_parent, node
            )));
        }
        if let Some(s) = new_sibling {
            self.require(s)?;
            if moved.contains(&s) {
                return Err(SceneError::RejectedOp(format!(
                    "move_subtree sibling {} lies inside the moved subtree of {}",
                    s, node
                )));
            }
            if !self.ordered_children(new_parent)?.contains(&s) {
                return Err(SceneError::RejectedOp(format!(
                    "node {} is not a child of {}",
                    s, new_parent
                )));
            }
        }

        // Detach: splice the referencing pointer past the node.
        let following = self.get(node).unwrap().right_sibling;
        if let Some((ref_id, pointer)) = self.referencer(node) {
            self.set_pointer(ref_id, pointer, following);
        }
        self.set_pointer(node, Pointer::RightSibling, None);

        // Attach after `new_sibling`, or as the new first child.
        match new_sibling {
            Some(s) => {
                let after = self.get(s).unwrap().right_sibling;
                self.set_pointer(node, Pointer::RightSibling, after);
                self.set_pointer(s, Pointer::RightSibling, Some(node));
            }
            None => {
                let former_first = self.get(new_parent).unwrap().left_child;
                self.set_pointer(node, Pointer::RightSibling, former_first);
                self.set_pointer(new_parent, Pointer::LeftChild, Some(node));
            }
        }
        Ok(())
    }

    fn apply_move_child(&mut self, parent: NodeId, child_node: NodeId, to_index: i64) -> Result<()> {
        let children = self.ordered_children(parent)?;
        if !children.contains(&child_node) {
            return Ok(());
        }
        let len = children.len() as i64;
        let index = if to_index >= 0 { to_index } else { len + to_index };
        if index < 0 || index >= len {
            return Ok(());
        }
        let mut order: Vec<NodeId> = children
            .into_iter()
            .filter(|&c| c != child_node)
            .collect();
        order.insert(index as usize, child_node);
        self.relink_children(parent, &order);
        Ok(())
    }

    fn apply_detach_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.require(child)?;
        if !self.ordered_children(parent)?.contains(&child) {
            return Err(SceneError::RejectedOp(format!(
                "node {} is not a child of {}",
                child, parent
            )));
        }
        let following = self.get(child).unwrap().right_sibling;
        if let Some((ref_id, pointer)) = self.referencer(child) {
            self.set_pointer(ref_id, pointer, following);
        }
        self.set_pointer(child, Pointer::RightSibling, None);
        Ok(())
    }

    fn apply_attach_child(
        &mut self,
        new_parent: Option<NodeId>,
        child: NodeId,
        position: u32,
    ) -> Result<()> {
        let Some(parent) = new_parent else {
            // The transferred node stays a root; nothing to rewrite.
            return Ok(());
        };
        self.require(child)?;
        self.require(parent)?;
        let mut order: Vec<NodeId> = self
            .ordered_children(parent)?
            .into_iter()
            .filter(|&c| c != child)
            .collect();
        let index = (position as usize).min(order.len());
        order.insert(index, child);
        self.relink_children(parent, &order);
        Ok(())
    }

    // ── Validation ─────────────────────────────────────────────────────

    /// Check LCRS validity over the local state: no dangling pointers, at
    /// most one referencer per node, exactly one root, and full
    /// reachability. Intended for replicas hosting every shard; a replica
    /// hosting a subset legitimately fails the root/reachability clauses.
    pub fn validate(&self) -> Result<()> {
        let live: Vec<NodeId> = self.live_nodes().collect();
        if live.is_empty() {
            return Ok(());
        }

        let mut referencers: HashMap<NodeId, usize> = HashMap::new();
        for &id in &live {
            let n = self.get(id).unwrap();
            for target in [n.left_child, n.right_sibling].into_iter().flatten() {
                if !self.contains(target) {
                    return Err(SceneError::InvariantViolation(format!(
                        "node {} references missing node {}",
                        id, target
                    )));
                }
                let count = referencers.entry(target).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(SceneError::InvariantViolation(format!(
                        "node {} is referenced more than once",
                        target
                    )));
                }
            }
        }

        let roots: Vec<NodeId> = live
            .iter()
            .copied()
            .filter(|id| !referencers.contains_key(id))
            .collect();
        if roots.len() != 1 {
            return Err(SceneError::InvariantViolation(format!(
                "expected exactly one root, found {:?}",
                roots
            )));
        }

        // Reachability from the root over both pointer fields.
        let mut reachable: HashSet<NodeId> = HashSet::new();
        let mut work = vec![roots[0]];
        while let Some(id) = work.pop() {
            if !reachable.insert(id) {
                continue;
            }
            let n = self.get(id).unwrap();
            work.extend(n.left_child);
            work.extend(n.right_sibling);
        }
        if reachable.len() != live.len() {
            return Err(SceneError::InvariantViolation(format!(
                "{} of {} live nodes reachable from root {}",
                reachable.len(),
                live.len(),
                roots[0]
            )));
        }
        Ok(())
    }
}
