//! ManageNodesUseCase: the registry of managed nodes.
//!
//! External callers register a node (identifier, controller address,
//! credentials, board type) before any task may target it.  The registry
//! hands out `Arc<Node>` so that every task shares the same node instance
//! and sees the same `discoverable` / `powered` flags.
//!
//! # Node lifecycle (for beginners)
//!
//! ```text
//! register ──► managed (tasks, discovery, keepalive) ──► deregister
//! ```
//!
//! Deregistration only removes the entry here; tearing down the node's gate,
//! session and plugin instance is coordinated by the management service.

use std::collections::HashMap;
use std::sync::Arc;

use oob_core::{Node, NodeId};
use parking_lot::RwLock;

/// In-memory registry of managed nodes.
///
/// # HashMap choice
///
/// A `HashMap<NodeId, Arc<Node>>` gives O(1) lookup on the dispatch hot path.
/// Iteration order is not guaranteed, so [`NodeRegistry::all`] sorts by id.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node`.
    ///
    /// Returns the shared instance and `true`, or the already registered
    /// instance and `false` when the id is taken (the new value is dropped so
    /// running tasks never see their node swapped underneath them).
    pub fn register(&self, node: Node) -> (Arc<Node>, bool) {
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(node.id()) {
            return (Arc::clone(existing), false);
        }
        let node = Arc::new(node);
        nodes.insert(node.id().clone(), Arc::clone(&node));
        (node, true)
    }

    pub fn get(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.read().get(id).cloned()
    }

    /// Removes a node, returning it if it was registered.
    pub fn remove(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.write().remove(id)
    }

    /// Snapshot of all nodes, sorted by id.
    pub fn all(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
