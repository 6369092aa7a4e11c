use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::LodNode;
use crate::pos::SectionPos;

/// Free-list of [`LodNode`] allocations.
///
/// Nodes carry several fixed-size grids, so recycling them avoids
/// re-allocating on every read. Checkout is scoped: [`PooledNode`] returns
/// its node on drop, on every exit path.
pub struct NodePool {
    free: Mutex<Vec<LodNode>>,
    capacity: usize,
}

impl NodePool {
    /// Creates a pool retaining at most `capacity` idle nodes.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            capacity,
        })
    }

    /// Checks out an empty node bound to `pos`, reusing a pooled allocation
    /// when one is available.
    pub fn acquire(self: &Arc<Self>, pos: SectionPos) -> PooledNode {
        let node = match self.free.lock().pop() {
            Some(mut node) => {
                node.reset(pos);
                node
            }
            None => LodNode::empty(pos),
        };
        PooledNode {
            node: Some(node),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle nodes currently held.
    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, node: LodNode) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(node);
        }
    }
}

/// RAII checkout of a [`LodNode`]; dereferences to the node and releases it
/// back to its pool when dropped.
pub struct PooledNode {
    node: Option<LodNode>,
    pool: Arc<NodePool>,
}

impl PooledNode {
    /// Detaches the node from the pool, transferring ownership to the caller.
    pub fn detach(mut self) -> LodNode {
        self.node.take().expect("node present until drop")
    }
}

impl std::fmt::Debug for PooledNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledNode").finish_non_exhaustive()
    }
}

impl Deref for PooledNode {
    type Target = LodNode;

    fn deref(&self) -> &LodNode {
        self.node.as_ref().expect("node present until drop")
    }
}

impl DerefMut for PooledNode {
    fn deref_mut(&mut self) -> &mut LodNode {
        self.node.as_mut().expect("node present until drop")
    }
}

impl Drop for PooledNode {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            self.pool.release(node);
        }
    }
}
