//! # Tree-Level Collaborator Surfaces
//!
//! The node engine never walks the tree itself. When an operation changes
//! something the parent level must know about (the node's first key, the
//! node becoming empty), it appends a side-effect record to a
//! [`CarryQueue`] that the caller applies after the node-level operation
//! has returned successfully. This mirrors how the engine is driven by the
//! balancing layer above it: mutate one node under its lock, then carry
//! the consequences upward.
//!
//! [`DkStore`] is the tree-wide delimiting-key table. It is guarded by a
//! single `RwLock` because a node's left/right key bounds are a relation
//! *between* siblings: any operation that can change a node's first key,
//! empty a node, or move items across a node boundary publishes under the
//! write lock, and a concurrent neighbor scan reads under the read lock.
//! Node-local mutation is already exclusive by construction (`&mut Node`).

use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::key::Key;

/// Block number of a formatted node; how the tree layer names nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// A consequence of a node-level mutation that the caller must apply at
/// the parent level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarryOp {
    /// The node's first key changed; refresh the delimiting key recorded
    /// for it in its parent.
    UpdateDelimitingKey(NodeId),
    /// The node is empty; remove the parent's pointer to it.
    RemoveNode(NodeId),
}

/// Ordered queue of pending parent-level side effects.
#[derive(Debug, Default)]
pub struct CarryQueue {
    ops: SmallVec<[CarryOp; 4]>,
}

impl CarryQueue {
    pub fn new() -> CarryQueue {
        CarryQueue::default()
    }

    pub fn post_key_update(&mut self, node: NodeId) {
        self.push(CarryOp::UpdateDelimitingKey(node));
    }

    pub fn post_removal(&mut self, node: NodeId) {
        self.push(CarryOp::RemoveNode(node));
    }

    fn push(&mut self, op: CarryOp) {
        // consecutive duplicates carry no extra information
        if self.ops.last() != Some(&op) {
            self.ops.push(op);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = CarryOp> + '_ {
        self.ops.drain(..)
    }

    pub fn ops(&self) -> &[CarryOp] {
        &self.ops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitingKeys {
    /// Smallest key the node may contain.
    pub left: Key,
    /// Exclusive upper bound of the node's key range.
    pub right: Key,
}

/// Tree-wide table of per-node delimiting keys.
#[derive(Default)]
pub struct DkStore {
    map: RwLock<HashMap<NodeId, DelimitingKeys>>,
}

impl DkStore {
    pub fn new() -> DkStore {
        DkStore::default()
    }

    pub fn set(&self, node: NodeId, left: Key, right: Key) {
        self.map
            .write()
            .insert(node, DelimitingKeys { left, right });
    }

    pub fn get(&self, node: NodeId) -> Option<DelimitingKeys> {
        self.map.read().get(&node).copied()
    }

    /// Collapse an emptied node's range: its left bound becomes its right
    /// bound, so neighbor scans see an empty key range until the pointer
    /// removal is carried out.
    pub fn note_emptied(&self, node: NodeId) {
        let mut map = self.map.write();
        if let Some(dk) = map.get_mut(&node) {
            dk.left = dk.right;
        }
    }

    pub fn forget(&self, node: NodeId) {
        self.map.write().remove(&node);
    }
}
