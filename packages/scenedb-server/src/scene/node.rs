//! Scene node records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node identifier. Valid ids are `1..=max_node_id`; 0 is the wire encoding
/// of the NULL sentinel and never names a live node.
pub type NodeId = u32;

/// A scene node in left-child/right-sibling representation.
///
/// The ordered children of a parent are obtained by following `left_child`
/// and then chaining `right_sibling` until `None`. Properties are an opaque
/// string-to-string map; a `BTreeMap` keeps iteration and serialization
/// order deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneNode {
    pub left_child: Option<NodeId>,
    pub right_sibling: Option<NodeId>,
    pub properties: BTreeMap<String, String>,
}

impl SceneNode {
    /// A detached node carrying the given properties.
    pub fn with_properties(properties: BTreeMap<String, String>) -> Self {
        Self {
            left_child: None,
            right_sibling: None,
            properties,
        }
    }
}
