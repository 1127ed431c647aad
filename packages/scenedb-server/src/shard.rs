//! Shard identity and node-to-shard placement.
//!
//! `ShardMap` tracks which shards replicate each node. In the multi-node
//! configuration every node is hosted by exactly one shard; the map is
//! mutated only by applying a committed `move_shard` sequence (migration) or
//! by recording the shard that created a node. Fresh roots get a
//! deterministic default placement from a blake3 hash of the node id, so
//! every replica computes the same assignment without coordination.

use std::collections::HashMap;

use crate::scene::NodeId;

/// Shard identifier. Small and dense, `0..shard_count`.
pub type ShardId = u16;

/// Replicated node-to-shard placement map.
#[derive(Debug, Clone)]
pub struct ShardMap {
    shard_count: u16,
    /// Hosting shards per node, sorted ascending. A missing entry means the
    /// node is unknown to the placement layer.
    hosts: HashMap<NodeId, Vec<ShardId>>,
}

impl ShardMap {
    /// Create an empty map over the given number of shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is 0.
    pub fn new(shard_count: u16) -> Self {
        assert!(shard_count > 0, "shard_count must be > 0");
        Self {
            shard_count,
            hosts: HashMap::new(),
        }
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Deterministic default placement for a node with no inherited shard
    /// (a fresh root): blake3 of the id, reduced via modulo.
    pub fn default_shard(&self, node: NodeId) -> ShardId {
        let hash = blake3::hash(&node.to_le_bytes());
        let hash_u64 = u64::from_le_bytes(hash.as_bytes()[0..8].try_into().unwrap());
        (hash_u64 % self.shard_count as u64) as u16
    }

    /// Record that `node` is hosted by exactly `shard`.
    pub fn assign(&mut self, node: NodeId, shard: ShardId) {
        debug_assert!(shard < self.shard_count);
        self.hosts.insert(node, vec![shard]);
    }

    /// Replicate `node` across every shard (single-node bootstrap rule).
    pub fn assign_all(&mut self, node: NodeId) {
        self.hosts.insert(node, (0..self.shard_count).collect());
    }

    /// Migrate `node` so its hosting set becomes `{new_shard}`.
    pub fn migrate(&mut self, node: NodeId, new_shard: ShardId) {
        debug_assert!(new_shard < self.shard_count);
        self.hosts.insert(node, vec![new_shard]);
    }

    /// Forget a deleted node.
    pub fn remove(&mut self, node: NodeId) {
        self.hosts.remove(&node);
    }

    /// The shard that owns `node` (smallest hosting shard id).
    pub fn owner(&self, node: NodeId) -> Option<ShardId> {
        self.hosts.get(&node).and_then(|s| s.first().copied())
    }

    /// All shards hosting `node`.
    pub fn hosts(&self, node: NodeId) -> &[ShardId] {
        self.hosts.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_hosted_on(&self, node: NodeId, shard: ShardId) -> bool {
        self.hosts(node).contains(&shard)
    }

    /// Nodes currently owned by `shard`, unordered.
    pub fn nodes_on(&self, shard: ShardId) -> Vec<NodeId> {
        self.hosts
            .iter()
            .filter(|(_, shards)| shards.first() == Some(&shard))
            .map(|(&node, _)| node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shard_deterministic() {
        let map = ShardMap::new(8);
        let a = map.default_shard(42);
        let b = map.default_shard(42);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn test_default_shard_spreads_ids() {
        let map = ShardMap::new(16);
        let shards: std::collections::HashSet<ShardId> =
            (1..=100).map(|id| map.default_shard(id)).collect();
        assert!(
            shards.len() >= 2,
            "expected at least 2 distinct shards, got {:?}",
            shards
        );
    }

    #[test]
    fn test_assign_and_migrate() {
        let mut map = ShardMap::new(2);
        map.assign(5, 0);
        assert_eq!(map.owner(5), Some(0));
        assert!(map.is_hosted_on(5, 0));
        assert!(!map.is_hosted_on(5, 1));

        map.migrate(5, 1);
        assert_eq!(map.owner(5), Some(1));
        assert_eq!(map.hosts(5), &[1]);
    }

    #[test]
    fn test_assign_all_replicates_everywhere() {
        let mut map = ShardMap::new(3);
        map.assign_all(1);
        assert_eq!(map.hosts(1), &[0, 1, 2]);
        assert_eq!(map.owner(1), Some(0));
    }

    #[test]
    fn test_remove_forgets_node() {
        let mut map = ShardMap::new(2);
        map.assign(9, 1);
        map.remove(9);
        assert_eq!(map.owner(9), None);
        assert!(map.hosts(9).is_empty());
    }

    #[test]
    #[should_panic(expected = "shard_count must be > 0")]
    fn test_zero_shards_panics() {
        ShardMap::new(0);
    }
}
