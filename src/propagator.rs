use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, warn};

use crate::locks::PositionLocks;
use crate::node::LodNode;
use crate::pos::{SectionPos, LEAF_DETAIL_LEVEL, ROOT_DETAIL_LEVEL};
use crate::repo::NodeRepo;
use crate::updater::NodeUpdater;
use crate::workers::{TaskHandle, WorkerPool};

/// Reference point (leaf-level cell coordinates) that propagation work is
/// ordered around, so data near the viewer becomes consistent first.
#[derive(Default)]
pub struct Viewpoint {
    x: AtomicI64,
    z: AtomicI64,
}

impl Viewpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, x: i64, z: i64) {
        self.x.store(x, Ordering::Relaxed);
        self.z.store(z, Ordering::Relaxed);
    }

    pub fn get(&self) -> (i64, i64) {
        (self.x.load(Ordering::Relaxed), self.z.load(Ordering::Relaxed))
    }
}

enum PropagateMessage {
    Shutdown,
}

/// Background loop that merges child data up into parents (and, when hole
/// filling is enabled, parent data down into children).
///
/// Lock ordering is the load-bearing rule in both directions: the coarser
/// position of a merged pair is always try-locked first and the finer
/// position blocking-locked second, never the reverse.
pub struct PropagationScheduler {
    shared: Arc<PropagatorShared>,
}

struct PropagatorShared {
    repo: Arc<NodeRepo>,
    updater: Arc<NodeUpdater>,
    locks: Arc<PositionLocks>,
    workers: Arc<WorkerPool>,
    viewpoint: Arc<Viewpoint>,
    /// Parents currently being merged; duplicate suppression and capacity
    /// enforcement.
    in_flight: Mutex<FxHashSet<SectionPos>>,
    max_tasks: usize,
    fill_holes: bool,
    interval: Duration,
}

/// Reservation in the in-flight set, released on every exit path.
struct InFlightSlot {
    shared: Arc<PropagatorShared>,
    pos: SectionPos,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.shared.in_flight.lock().remove(&self.pos);
    }
}

impl PropagationScheduler {
    pub fn new(
        repo: Arc<NodeRepo>,
        updater: Arc<NodeUpdater>,
        locks: Arc<PositionLocks>,
        workers: Arc<WorkerPool>,
        viewpoint: Arc<Viewpoint>,
    ) -> Self {
        let max_tasks = repo.options().max_propagate_tasks();
        let fill_holes = repo.options().fill_holes_with_parent_data;
        let interval = repo.options().propagate_interval;
        let shared = Arc::new(PropagatorShared {
            max_tasks,
            fill_holes,
            interval,
            repo,
            updater,
            locks,
            workers,
            viewpoint,
            in_flight: Mutex::new(FxHashSet::default()),
        });
        Self { shared }
    }

    /// Spawns the interval-woken loop thread. Stopping is cooperative via
    /// the returned handle; in-flight merges are never aborted.
    pub fn start(&self) -> PropagationHandle {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("lod-propagate".into())
            .spawn(move || loop {
                match receiver.recv_timeout(shared.interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        shared.run_cycle();
                    }
                    Ok(PropagateMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .expect("failed to spawn propagation thread");
        PropagationHandle {
            sender,
            thread: Some(thread),
        }
    }

    /// Runs one wake cycle immediately, returning the handles of the merge
    /// tasks it scheduled. The background loop ignores the handles; tests
    /// and embedders can wait on them for deterministic settling.
    pub fn run_cycle(&self) -> Vec<TaskHandle> {
        self.shared.run_cycle()
    }

    /// Parents currently being merged; diagnostics only.
    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}

impl PropagatorShared {
    fn run_cycle(self: &Arc<Self>) -> Vec<TaskHandle> {
        let mut handles = self.run_parent_updates();
        if self.fill_holes {
            handles.extend(self.run_child_updates());
        }
        handles
    }

    /// Up-propagation: merge flagged children into their parents.
    fn run_parent_updates(self: &Arc<Self>) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        if self.at_capacity() {
            return handles;
        }

        let (ref_x, ref_z) = self.viewpoint.get();
        let flagged = match self
            .repo
            .store()
            .positions_needing_parent_merge(ref_x, ref_z, self.max_tasks)
        {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "propagate.up.query_failed");
                return handles;
            }
        };

        // Group children by parent, preserving the proximity order of the
        // first child seen for each parent.
        let mut order = Vec::new();
        let mut children_by_parent: FxHashMap<SectionPos, Vec<SectionPos>> = FxHashMap::default();
        for child in flagged {
            if child.detail_level() >= ROOT_DETAIL_LEVEL {
                // A stored flag this coarse is stale data from an older
                // writer; clear it so it stops occupying a query slot.
                if let Err(err) = self.repo.store().clear_parent_flag(child) {
                    warn!(pos = %child, error = %err, "propagate.up.clear_failed");
                }
                continue;
            }
            let parent = child.parent();
            children_by_parent
                .entry(parent)
                .or_insert_with(|| {
                    order.push(parent);
                    Vec::new()
                })
                .push(child);
        }

        for parent in order {
            if self.at_capacity() {
                break;
            }
            if !self.in_flight.lock().insert(parent) {
                continue;
            }
            let slot = InFlightSlot {
                shared: Arc::clone(self),
                pos: parent,
            };
            let children = children_by_parent.remove(&parent).unwrap_or_default();
            let shared = Arc::clone(self);
            let submitted = self.workers.try_submit(move || {
                let _slot = slot;
                shared.merge_children_into_parent(parent, &children);
            });
            match submitted {
                Some(handle) => handles.push(handle),
                // Pool is gone; the dropped slot releases the reservation.
                None => break,
            }
        }
        handles
    }

    /// Down-propagation: fill holes in the children of flagged parents.
    fn run_child_updates(self: &Arc<Self>) -> Vec<TaskHandle> {
        let mut handles = Vec::new();
        if self.at_capacity() {
            return handles;
        }

        let (ref_x, ref_z) = self.viewpoint.get();
        let flagged = match self
            .repo
            .store()
            .positions_needing_child_merge(ref_x, ref_z, self.max_tasks)
        {
            Ok(positions) => positions,
            Err(err) => {
                warn!(error = %err, "propagate.down.query_failed");
                return handles;
            }
        };

        for parent in flagged {
            if parent.detail_level() <= LEAF_DETAIL_LEVEL {
                if let Err(err) = self.repo.store().clear_children_flag(parent) {
                    warn!(pos = %parent, error = %err, "propagate.down.clear_failed");
                }
                continue;
            }
            if self.at_capacity() {
                break;
            }
            if !self.in_flight.lock().insert(parent) {
                continue;
            }
            let slot = InFlightSlot {
                shared: Arc::clone(self),
                pos: parent,
            };
            let shared = Arc::clone(self);
            let submitted = self.workers.try_submit(move || {
                let _slot = slot;
                shared.spread_parent_into_children(parent);
            });
            match submitted {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        handles
    }

    fn at_capacity(&self) -> bool {
        self.workers.queue_depth() >= self.max_tasks
            || self.in_flight.lock().len() >= self.max_tasks
    }

    fn merge_children_into_parent(&self, parent: SectionPos, children: &[SectionPos]) {
        let parent_lock = self.locks.get_lock(parent);
        // The coarser position is only ever try-locked: if another writer
        // holds the parent, skip this cycle instead of risking the
        // parent-waits-child / child-waits-parent cycle.
        let Some(_parent_guard) = parent_lock.try_lock() else {
            debug!(parent = %parent, "propagate.up.parent_busy");
            return;
        };
        self.updater.note_locked(parent);

        if let Some(mut parent_node) = self.repo.get(parent) {
            for &child in children {
                self.merge_one_child(&mut parent_node, parent, child);
            }

            // The updater flags the parent for its own upward merge when the
            // write actually changed something.
            self.updater.update(&parent_node, false);
        }

        self.updater.note_unlocked(parent);
    }

    fn merge_one_child(&self, parent_node: &mut LodNode, parent: SectionPos, child: SectionPos) {
        // The finer position blocks: the only coarser ancestor in play is
        // already held, so no cycle is possible.
        let child_lock = self.locks.get_lock(child);
        let _child_guard = child_lock.lock();
        self.updater.note_locked(child);

        if let Some(child_node) = self.repo.get(child) {
            parent_node.merge_from(&child_node);
        }

        // Cleared even when the read failed, so a persistently bad pair
        // cannot occupy an in-flight slot cycle after cycle.
        if let Err(err) = self.repo.store().clear_parent_flag(child) {
            error!(
                parent = %parent,
                child = %child,
                error = %err,
                "propagate.up.clear_flag_failed"
            );
        }
        self.updater.note_unlocked(child);
    }

    fn spread_parent_into_children(&self, parent: SectionPos) {
        let parent_lock = self.locks.get_lock(parent);
        let Some(_parent_guard) = parent_lock.try_lock() else {
            debug!(parent = %parent, "propagate.down.parent_busy");
            return;
        };
        self.updater.note_locked(parent);

        if let Some(parent_node) = self.repo.get(parent) {
            for index in 0..4 {
                self.fill_one_child(&parent_node, parent, parent.child(index));
            }
        }

        self.updater.note_unlocked(parent);
    }

    fn fill_one_child(&self, parent_node: &LodNode, parent: SectionPos, child: SectionPos) {
        let child_lock = self.locks.get_lock(child);
        let _child_guard = child_lock.lock();
        self.updater.note_locked(child);

        if let Some(mut child_node) = self.repo.get(child) {
            if child_node.merge_from(parent_node) {
                if child.detail_level() > LEAF_DETAIL_LEVEL {
                    // Continue downward next cycle.
                    child_node.apply_to_children = true;
                }
                self.updater.update(&child_node, false);
            }
        }

        if let Err(err) = self.repo.store().clear_children_flag(parent) {
            error!(
                parent = %parent,
                child = %child,
                error = %err,
                "propagate.down.clear_flag_failed"
            );
        }
        self.updater.note_unlocked(child);
    }
}

/// Owner handle for the propagation loop thread. Dropping it (or calling
/// [`PropagationHandle::stop`]) signals the loop and joins the thread.
pub struct PropagationHandle {
    sender: Sender<PropagateMessage>,
    thread: Option<JoinHandle<()>>,
}

impl PropagationHandle {
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.sender.send(PropagateMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PropagationHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
