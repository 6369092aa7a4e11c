use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::locks::PositionLocks;
use crate::migrate::{LegacyMigrator, MigrationHandle, MigrationProgress};
use crate::node::Direction;
use crate::options::StoreOptions;
use crate::pool::PooledNode;
use crate::pos::SectionPos;
use crate::propagator::{PropagationHandle, PropagationScheduler, Viewpoint};
use crate::repo::NodeRepo;
use crate::store::NodeStore;
use crate::updater::{NodeUpdater, UpdateListener};
use crate::workers::{TaskHandle, WorkerPool};

/// Hook able to produce data for positions the store has never seen, for
/// example by running world generation. All methods default to a no-op so a
/// read-only embedder can skip it entirely.
pub trait RetrievalSource: Send + Sync {
    /// Whether the source can currently take requests.
    fn is_ready(&self) -> bool {
        true
    }

    /// Asks the source to produce data for a missing position. Delivery is
    /// asynchronous: the source eventually pushes the result back through
    /// [`DataSourceProvider::update`].
    fn request(&self, _pos: SectionPos) {}
}

/// Owner of the whole persistence stack: repository, updater, propagation
/// scheduler, legacy migrator and the worker pool they share.
///
/// Construction wires everything; [`DataSourceProvider::start`] spawns the
/// background threads and [`DataSourceProvider::close`] tears them down in
/// dependency order. Reads after close return `None` instead of erroring.
pub struct DataSourceProvider {
    repo: Arc<NodeRepo>,
    updater: Arc<NodeUpdater>,
    workers: Arc<WorkerPool>,
    scheduler: PropagationScheduler,
    migrator: LegacyMigrator,
    viewpoint: Arc<Viewpoint>,
    propagation: Mutex<Option<PropagationHandle>>,
    migration: Mutex<Option<MigrationHandle>>,
}

impl DataSourceProvider {
    pub fn new(store: Arc<dyn NodeStore>, options: StoreOptions) -> Self {
        let worker_threads = options.worker_threads;
        let repo = NodeRepo::new(store, options);
        let locks = PositionLocks::new();
        let workers = WorkerPool::new("lod-update", worker_threads);
        let updater = NodeUpdater::new(Arc::clone(&repo), Arc::clone(&locks), Arc::clone(&workers));
        let viewpoint = Viewpoint::new();
        let scheduler = PropagationScheduler::new(
            Arc::clone(&repo),
            Arc::clone(&updater),
            locks,
            Arc::clone(&workers),
            Arc::clone(&viewpoint),
        );
        let migrator = LegacyMigrator::new(Arc::clone(&repo), Arc::clone(&updater));
        Self {
            repo,
            updater,
            workers,
            scheduler,
            migrator,
            viewpoint,
            propagation: Mutex::new(None),
            migration: Mutex::new(None),
        }
    }

    /// Spawns the propagation loop and the migration pass. Idempotent.
    pub fn start(&self) {
        let mut propagation = self.propagation.lock();
        if propagation.is_none() {
            *propagation = Some(self.scheduler.start());
        }
        let mut migration = self.migration.lock();
        if migration.is_none() {
            *migration = Some(self.migrator.start());
        }
    }

    /// Loads the node at `pos`, or an empty node when nothing is stored.
    /// `None` only while shut down or when the read failed.
    pub fn get(&self, pos: SectionPos) -> Option<PooledNode> {
        self.repo.get(pos)
    }

    /// Loads only the border strip of `pos` facing `direction`.
    pub fn get_adjacent(&self, pos: SectionPos, direction: Direction) -> Option<PooledNode> {
        self.repo.get_adjacent(pos, direction)
    }

    /// Last-modified timestamp for `pos`, `None` while shut down or when
    /// nothing is stored.
    pub fn timestamp_for(&self, pos: SectionPos) -> Option<u64> {
        self.repo.timestamp_for(pos)
    }

    /// Queues `input` to be merged into the stored node at its position.
    pub fn update(&self, input: PooledNode) -> TaskHandle {
        self.updater.update_async(input)
    }

    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) {
        self.updater.add_listener(listener);
    }

    /// Moves the reference point propagation work is ordered around.
    pub fn set_viewpoint(&self, x: i64, z: i64) {
        self.viewpoint.set(x, z);
    }

    /// Runs one propagation wake cycle on the calling thread, returning the
    /// scheduled merge handles. Useful for embedders that drive settling
    /// themselves instead of running the background loop.
    pub fn run_propagation_cycle(&self) -> Vec<TaskHandle> {
        self.scheduler.run_cycle()
    }

    /// False while legacy migration still owns the store's write bandwidth
    /// or the provider has shut down. Says nothing about whether a retrieval
    /// source exists; embedders poll this to know when the store is open for
    /// retrieval traffic again.
    pub fn can_queue_retrieval(&self) -> bool {
        !self.repo.is_shut_down() && !self.migrator.is_running()
    }

    /// Forwards `pos` to the retrieval source. Returns whether the request
    /// was accepted; a missing or unready source refuses it.
    pub fn queue_retrieval(&self, pos: SectionPos) -> bool {
        if !self.can_queue_retrieval() {
            return false;
        }
        match &self.repo.options().retrieval {
            Some(source) if source.is_ready() => {
                source.request(pos);
                true
            }
            _ => false,
        }
    }

    /// True while the legacy migration pass is still executing (or has not
    /// yet been started).
    pub fn migration_in_progress(&self) -> bool {
        self.migrator.is_running()
    }

    pub fn migration_progress(&self) -> MigrationProgress {
        self.migrator.progress()
    }

    /// Queued async updates for a position; diagnostics only.
    pub fn queued_update_count(&self, pos: SectionPos) -> u32 {
        self.updater.queued_update_count(pos)
    }

    /// Snapshot of positions currently locked by update or merge work.
    pub fn locked_positions(&self) -> Vec<SectionPos> {
        self.updater.locked_positions()
    }

    pub fn repo(&self) -> &Arc<NodeRepo> {
        &self.repo
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        self.repo.store()
    }

    /// Stops background work and drains the worker pool. New reads return
    /// `None` and new updates resolve immediately; in-flight merges finish.
    pub fn close(&self) {
        info!("provider.close");
        self.repo.shut_down();
        self.updater.close();
        if let Some(handle) = self.propagation.lock().take() {
            handle.stop();
        }
        self.migrator.request_stop();
        if let Some(handle) = self.migration.lock().take() {
            handle.stop();
        }
        self.workers.shutdown();
    }
}

impl Drop for DataSourceProvider {
    fn drop(&mut self) {
        self.close();
    }
}
