use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::pos::SectionPos;

/// Registry mapping a [`SectionPos`] to a stable, reusable write lock.
///
/// Entries are created lazily and never removed; the tree's address space is
/// finite, so the registry stays bounded. All mutation of a position's node
/// and record happens under that position's lock.
#[derive(Default)]
pub struct PositionLocks {
    locks: Mutex<FxHashMap<SectionPos, Arc<Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the lock for `pos`, the same instance for every caller and
    /// thread. Infallible.
    pub fn get_lock(&self, pos: SectionPos) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(pos).or_default())
    }

    /// Number of positions a lock has been handed out for.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
