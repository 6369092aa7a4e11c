use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::error;

use crate::locks::PositionLocks;
use crate::node::LodNode;
use crate::pool::PooledNode;
use crate::pos::{SectionPos, LEAF_DETAIL_LEVEL, ROOT_DETAIL_LEVEL};
use crate::record::NodeRecord;
use crate::repo::NodeRepo;
use crate::workers::{TaskHandle, WorkerPool};

/// Callback invoked with the merged node whenever a persisted change
/// actually occurs for a position. Called while the position's lock is held.
pub trait UpdateListener: Send + Sync {
    fn on_node_updated(&self, node: &LodNode);
}

/// Applies incoming node data into the stored node for the same position,
/// under the position's lock, persisting when something changed.
///
/// Failures during merge or persist are logged with the position and
/// swallowed; `update` never propagates an error to its caller and the lock
/// release is unconditional.
pub struct NodeUpdater {
    repo: Arc<NodeRepo>,
    locks: Arc<PositionLocks>,
    workers: Arc<WorkerPool>,
    listeners: Mutex<Vec<Arc<dyn UpdateListener>>>,
    /// Positions currently locked by update work; diagnostics only.
    locked_positions: Mutex<FxHashSet<SectionPos>>,
    /// Per-position queued async update counts; diagnostics only.
    queued_counts: Mutex<FxHashMap<SectionPos, u32>>,
    shutdown: AtomicBool,
}

impl NodeUpdater {
    pub fn new(
        repo: Arc<NodeRepo>,
        locks: Arc<PositionLocks>,
        workers: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            locks,
            workers,
            listeners: Mutex::new(Vec::new()),
            locked_positions: Mutex::new(FxHashSet::default()),
            queued_counts: Mutex::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) {
        self.listeners.lock().push(listener);
    }

    /// Schedules `update(input, lock: true)` on the worker pool.
    ///
    /// Resolves immediately as a no-op when the updater or its pool is shut
    /// down. The per-position queued count is decremented when the task
    /// finishes regardless of outcome.
    pub fn update_async(self: &Arc<Self>, input: PooledNode) -> TaskHandle {
        if self.shutdown.load(Ordering::SeqCst) || self.repo.is_shut_down() {
            return TaskHandle::completed();
        }
        if self.workers.is_shut_down() {
            return TaskHandle::completed();
        }

        let pos = input.pos();
        self.mark_update_start(pos);
        let updater = Arc::clone(self);
        let submitted = self.workers.try_submit(move || {
            updater.update(&input, true);
            updater.mark_update_end(pos);
        });
        match submitted {
            Some(handle) => handle,
            None => {
                // The pool shut down while this task was queued.
                self.mark_update_end(pos);
                TaskHandle::completed()
            }
        }
    }

    /// Merges `input` into the stored node for its position and persists the
    /// result when anything changed.
    ///
    /// With `lock` set the position's write lock is taken (blocking); pass
    /// `false` only when the caller already holds that lock.
    pub fn update(&self, input: &LodNode, lock: bool) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let pos = input.pos();
        if lock {
            // Two unlocked writers racing the same position would leave the
            // stored node holding only the later write.
            let position_lock = self.locks.get_lock(pos);
            let _guard = position_lock.lock();
            self.note_locked(pos);
            self.apply_logged(input, pos);
            self.note_unlocked(pos);
        } else {
            self.apply_logged(input, pos);
        }
    }

    fn apply_logged(&self, input: &LodNode, pos: SectionPos) {
        if let Err(err) = self.try_apply(input, pos) {
            error!(pos = %pos, error = %err, "updater.update.failed");
        }
    }

    fn try_apply(&self, input: &LodNode, pos: SectionPos) -> crate::error::Result<()> {
        // `None` means the store is shutting down; skip quietly.
        let Some(mut current) = self.repo.get(pos) else {
            return Ok(());
        };

        let mut changed = current.merge_from(input);
        // Propagation requests on the input survive the merge; a newly raised
        // flag has to reach the store even when no column changed. Positions
        // at the ends of the hierarchy never carry the outward flag, since
        // no cycle would ever consume (and clear) it.
        if input.apply_to_parent
            && pos.detail_level() < ROOT_DETAIL_LEVEL
            && !current.apply_to_parent
        {
            current.apply_to_parent = true;
            changed = true;
        }
        if input.apply_to_children
            && pos.detail_level() > LEAF_DETAIL_LEVEL
            && !current.apply_to_children
        {
            current.apply_to_children = true;
            changed = true;
        }

        if changed {
            // Any persisted change re-enters up-propagation so coarser
            // levels absorb it; the root has nowhere further to go.
            if pos.detail_level() < ROOT_DETAIL_LEVEL {
                current.apply_to_parent = true;
            }
            let record = NodeRecord::from_node(&current, self.repo.options().compression)?;
            self.repo.store().save(record)?;

            let listeners = self.listeners.lock().clone();
            for listener in &listeners {
                listener.on_node_updated(&current);
            }
        }
        Ok(())
    }

    pub fn repo(&self) -> &Arc<NodeRepo> {
        &self.repo
    }

    /// Queued async updates for a position; diagnostics only.
    pub fn queued_update_count(&self, pos: SectionPos) -> u32 {
        self.queued_counts.lock().get(&pos).copied().unwrap_or(0)
    }

    /// Snapshot of positions currently locked by update work.
    pub fn locked_positions(&self) -> Vec<SectionPos> {
        self.locked_positions.lock().iter().copied().collect()
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn note_locked(&self, pos: SectionPos) {
        self.locked_positions.lock().insert(pos);
    }

    pub(crate) fn note_unlocked(&self, pos: SectionPos) {
        self.locked_positions.lock().remove(&pos);
    }

    fn mark_update_start(&self, pos: SectionPos) {
        *self.queued_counts.lock().entry(pos).or_insert(0) += 1;
    }

    fn mark_update_end(&self, pos: SectionPos) {
        let mut counts = self.queued_counts.lock();
        if let Some(count) = counts.get_mut(&pos) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&pos);
            }
        }
    }
}
