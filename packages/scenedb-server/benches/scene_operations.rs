//! Benchmark suite for scene-tree state machine operations
//!
//! Covers the hot paths of the deterministic applier:
//! - Structure: add_child, move_child, move_subtree, remove_node
//! - Properties: set_property, batch_update
//! - Traversal: descendants, ordered_children
//! - Validation: full LCRS check
//!
//! Run: cargo bench --bench scene_operations

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use scenedb::scene::{NodeId, PropertyUpdate, SceneOp, SceneState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TREE_SIZE: u32 = 800;
const BRANCHING: u32 = 8;

fn add_child(target: Option<NodeId>, new_node: NodeId) -> SceneOp {
    SceneOp::AddChild {
        target,
        new_node,
        properties: BTreeMap::new(),
    }
}

/// Tree of `size` nodes with branching factor `BRANCHING`: node i hangs
/// under (i - 2) / BRANCHING + 1.
fn build_tree(size: u32) -> SceneState {
    let mut state = SceneState::new(1000);
    state.apply(&add_child(None, 1)).unwrap();
    for id in 2..=size {
        let parent = (id - 2) / BRANCHING + 1;
        state.apply(&add_child(Some(parent), id)).unwrap();
    }
    state
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_structure_ops(c: &mut Criterion) {
    let tree = build_tree(TREE_SIZE);

    c.bench_function("add_child", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut state| state.apply(&add_child(Some(1), 999)).unwrap(),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("move_child_to_front", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut state| {
                state
                    .apply(&SceneOp::MoveChild {
                        parent: 1,
                        child_node: 9,
                        to_index: 0,
                    })
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("move_subtree", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut state| {
                state
                    .apply(&SceneOp::MoveSubtree {
                        node: 2,
                        new_parent: 3,
                        new_sibling: None,
                    })
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("remove_subtree", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut state| state.apply(&SceneOp::RemoveNode { node: 2 }).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_property_ops(c: &mut Criterion) {
    let tree = build_tree(TREE_SIZE);

    c.bench_function("set_property", |b| {
        b.iter_batched(
            || tree.clone(),
            |mut state| {
                state
                    .apply(&SceneOp::SetProperty {
                        node: 42,
                        key: "material".into(),
                        value: "steel".into(),
                    })
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("batch_update_32", |b| {
        let updates: Vec<PropertyUpdate> = (2..34)
            .map(|node| PropertyUpdate {
                node,
                key: "visible".into(),
                value: "true".into(),
            })
            .collect();
        b.iter_batched(
            || (tree.clone(), SceneOp::BatchUpdate { updates: updates.clone() }),
            |(mut state, op)| state.apply(&op).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

fn bench_traversals(c: &mut Criterion) {
    let tree = build_tree(TREE_SIZE);

    c.bench_function("descendants_root", |b| {
        b.iter(|| black_box(tree.descendants(black_box(1))))
    });

    c.bench_function("descendants_mid", |b| {
        b.iter(|| black_box(tree.descendants(black_box(2))))
    });

    c.bench_function("ordered_children", |b| {
        b.iter(|| black_box(tree.ordered_children(black_box(1)).unwrap()))
    });

    c.bench_function("validate_full_tree", |b| {
        b.iter(|| tree.validate().unwrap())
    });
}

criterion_group!(
    benches,
    bench_structure_ops,
    bench_property_ops,
    bench_traversals
);
criterion_main!(benches);
