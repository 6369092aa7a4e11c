use std::sync::Arc;
use std::time::Duration;

use crate::migrate::NotificationSink;
use crate::provider::RetrievalSource;
use crate::record::CompressionMode;

/// Configuration supplied when opening a [`crate::provider::DataSourceProvider`].
#[derive(Clone)]
pub struct StoreOptions {
    /// Codec used when encoding new records.
    pub compression: CompressionMode,
    /// Enables down-propagation: coarser data is pushed into missing finer
    /// nodes to fill holes.
    pub fill_holes_with_parent_data: bool,
    /// Threads in the merge/persist worker pool.
    pub worker_threads: usize,
    /// Propagation tasks allowed in flight per worker thread.
    pub tasks_per_thread: usize,
    /// Sleep between propagation wake cycles.
    pub propagate_interval: Duration,
    /// Legacy rows converted per migration batch.
    pub migration_batch_size: usize,
    /// Unused legacy rows deleted per prune batch.
    pub migration_prune_batch_size: usize,
    /// Upper bound on waiting for one migration batch of updates. Long
    /// enough that only a genuinely stuck worker pool trips it.
    pub migration_batch_timeout: Duration,
    /// Idle nodes retained by the node pool.
    pub node_pool_capacity: usize,
    /// Sink for user-visible migration notifications.
    pub notifications: Option<Arc<dyn NotificationSink>>,
    /// World-generation hook able to retrieve missing nodes.
    pub retrieval: Option<Arc<dyn RetrievalSource>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMode::Snappy,
            fill_holes_with_parent_data: false,
            worker_threads: 4,
            tasks_per_thread: 5,
            propagate_interval: Duration::from_millis(250),
            migration_batch_size: 5,
            migration_prune_batch_size: 50,
            migration_batch_timeout: Duration::from_secs(5 * 60),
            node_pool_capacity: 32,
            notifications: None,
            retrieval: None,
        }
    }
}

impl StoreOptions {
    /// Upper bound on propagation tasks in flight during one wake cycle.
    pub fn max_propagate_tasks(&self) -> usize {
        self.tasks_per_thread * self.worker_threads
    }

    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.compression = mode;
        self
    }

    pub fn fill_holes_with_parent_data(mut self, enabled: bool) -> Self {
        self.fill_holes_with_parent_data = enabled;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn propagate_interval(mut self, interval: Duration) -> Self {
        self.propagate_interval = interval;
        self
    }

    pub fn migration_batch_timeout(mut self, timeout: Duration) -> Self {
        self.migration_batch_timeout = timeout;
        self
    }

    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    pub fn retrieval(mut self, source: Arc<dyn RetrievalSource>) -> Self {
        self.retrieval = Some(source);
        self
    }
}
