use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::node::Direction;
use crate::options::StoreOptions;
use crate::pool::{NodePool, PooledNode};
use crate::pos::SectionPos;
use crate::record::{FormatVersion, NodeRecord};
use crate::store::NodeStore;

/// Read/write facade over the [`NodeStore`].
///
/// Converts between records and nodes, self-heals corrupted or
/// legacy-format records, and shields callers from storage failures:
/// everything that goes wrong is logged (once per distinct message, to avoid
/// log storms from a single recurring bad record) and surfaced as `None`.
pub struct NodeRepo {
    store: Arc<dyn NodeStore>,
    pool: Arc<NodePool>,
    options: StoreOptions,
    shutdown: AtomicBool,
    logged_errors: Mutex<FxHashSet<String>>,
}

impl NodeRepo {
    pub fn new(store: Arc<dyn NodeStore>, options: StoreOptions) -> Arc<Self> {
        let pool = NodePool::new(options.node_pool_capacity);
        Arc::new(Self {
            store,
            pool,
            options,
            shutdown: AtomicBool::new(false),
            logged_errors: Mutex::new(FxHashSet::default()),
        })
    }

    /// Returns the node stored for `pos`, or `None` while shutting down or
    /// after a logged storage failure. A missing record yields a fresh empty
    /// node.
    ///
    /// A legacy-format record is decoded and written back upgraded exactly
    /// once; a record that fails to decode is deleted so the position can be
    /// regenerated.
    pub fn get(&self, pos: SectionPos) -> Option<PooledNode> {
        if self.is_shut_down() {
            return None;
        }

        let record = match self.store.get_record(pos) {
            Ok(Some(record)) => record,
            Ok(None) => return Some(self.pool.acquire(pos)),
            Err(err) => {
                self.log_read_failure(pos, &err);
                return None;
            }
        };

        let legacy = record.format == FormatVersion::V1NoAdjacency;
        match record.to_node(&self.pool) {
            Ok(node) => {
                if legacy {
                    self.upgrade_legacy_record(&node);
                }
                Some(node)
            }
            Err(StoreError::Corruption(message)) => {
                if self.log_once(&message) {
                    warn!(
                        pos = %pos,
                        error = %message,
                        "repo.get.corrupt_record_deleted"
                    );
                }
                if let Err(err) = self.store.delete(pos) {
                    warn!(pos = %pos, error = %err, "repo.get.corrupt_delete_failed");
                }
                None
            }
            Err(err) => {
                self.log_read_failure(pos, &err);
                None
            }
        }
    }

    /// Returns only the border data for one cardinal direction, used by
    /// render consumers that need a neighbor's edge rather than its whole
    /// grid. Legacy records are transparently upgraded through [`Self::get`]
    /// and trimmed.
    pub fn get_adjacent(&self, pos: SectionPos, direction: Direction) -> Option<PooledNode> {
        if self.is_shut_down() {
            return None;
        }

        let record = match self.store.get_adjacent_record(pos, direction) {
            Ok(Some(record)) => record,
            Ok(None) => return Some(self.pool.acquire(pos)),
            Err(err) => {
                self.log_read_failure(pos, &err);
                return None;
            }
        };

        if record.format == FormatVersion::V1NoAdjacency {
            let mut node = self.get(pos)?;
            node.retain_only_adjacent(direction);
            return Some(node);
        }

        match record.to_adjacent_node(direction, &self.pool) {
            Ok(node) => Some(node),
            Err(StoreError::Corruption(message)) => {
                if self.log_once(&message) {
                    warn!(
                        pos = %pos,
                        error = %message,
                        "repo.get_adjacent.corrupt_record_deleted"
                    );
                }
                if let Err(err) = self.store.delete(pos) {
                    warn!(pos = %pos, error = %err, "repo.get_adjacent.corrupt_delete_failed");
                }
                None
            }
            Err(err) => {
                self.log_read_failure(pos, &err);
                None
            }
        }
    }

    /// Last-modified timestamp passthrough, `None` while shutting down.
    pub fn timestamp_for(&self, pos: SectionPos) -> Option<u64> {
        if self.is_shut_down() {
            return None;
        }
        match self.store.timestamp_for(pos) {
            Ok(timestamp) => timestamp,
            Err(err) => {
                self.log_read_failure(pos, &err);
                None
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Flags the repo as shutting down; subsequent reads return `None`.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        debug!("repo.shut_down");
    }

    fn upgrade_legacy_record(&self, node: &PooledNode) {
        let upgraded = match NodeRecord::from_node(node, self.options.compression) {
            Ok(record) => record,
            Err(err) => {
                warn!(pos = %node.pos(), error = %err, "repo.upgrade.encode_failed");
                return;
            }
        };
        if let Err(err) = self.store.save(upgraded) {
            warn!(pos = %node.pos(), error = %err, "repo.upgrade.save_failed");
        } else {
            debug!(pos = %node.pos(), "repo.upgrade.rewrote_legacy_record");
        }
    }

    fn log_read_failure(&self, pos: SectionPos, err: &StoreError) {
        let message = err.to_string();
        if self.log_once(&message) {
            warn!(
                pos = %pos,
                error = %message,
                "repo.read_failed_first_occurrence"
            );
        }
    }

    /// True the first time this exact message is seen in this process.
    fn log_once(&self, message: &str) -> bool {
        self.logged_errors.lock().insert(message.to_string())
    }
}
