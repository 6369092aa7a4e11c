use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::pos::SectionPos;
use crate::repo::NodeRepo;
use crate::updater::NodeUpdater;

/// Receiver for user-facing migration lifecycle messages. All methods have
/// no-op defaults so embedders implement only what they surface.
pub trait NotificationSink: Send + Sync {
    fn migration_started(&self) {}

    fn migration_progress(&self, _progress: &MigrationProgress) {}

    fn migration_finished(&self) {}

    fn migration_stopped(&self) {}

    fn migration_failed(&self, _message: &str) {}
}

/// Sink that drops every notification.
#[derive(Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Pruning,
    Converting,
    Complete,
    Failed,
}

/// Counters snapshot handed to the notification sink and exposed for
/// diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub deleted: u64,
    pub converted: u64,
    pub failed: u64,
    pub remaining: u64,
}

impl MigrationProgress {
    /// Short human-readable form for overlay-style sinks.
    pub fn message(&self) -> String {
        match self.phase {
            MigrationPhase::Pruning => format!("Migrating - Deleting #: {}", self.remaining),
            MigrationPhase::Converting => format!("Migrating - Conversion #: {}", self.remaining),
            MigrationPhase::Complete => "Migration Complete".to_string(),
            MigrationPhase::Failed => "Migration Failed".to_string(),
        }
    }
}

/// One-shot background pass that upgrades legacy-format rows into the
/// current format.
///
/// Two phases run in order: pruning, which bulk-deletes legacy rows nothing
/// references any more, then conversion, which decodes each remaining row,
/// re-saves it through the updater with its parent flag raised, and deletes
/// the legacy row once the write settles. Stopping is cooperative and only
/// observed between batches.
pub struct LegacyMigrator {
    shared: Arc<MigratorShared>,
}

struct MigratorShared {
    repo: Arc<NodeRepo>,
    updater: Arc<NodeUpdater>,
    /// Pessimistically true from construction until the first full pass
    /// finishes, so retrieval stays gated even before `start`.
    running: AtomicBool,
    stop: AtomicBool,
    started_notified: AtomicBool,
    stopped_with_error: AtomicBool,
    deleted: AtomicU64,
    converted: AtomicU64,
    failed: AtomicU64,
}

impl LegacyMigrator {
    pub fn new(repo: Arc<NodeRepo>, updater: Arc<NodeUpdater>) -> Self {
        Self {
            shared: Arc::new(MigratorShared {
                repo,
                updater,
                running: AtomicBool::new(true),
                stop: AtomicBool::new(false),
                started_notified: AtomicBool::new(false),
                stopped_with_error: AtomicBool::new(false),
                deleted: AtomicU64::new(0),
                converted: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Runs the whole migration on a named background thread.
    pub fn start(&self) -> MigrationHandle {
        let shared = Arc::clone(&self.shared);
        let thread = thread::Builder::new()
            .name("lod-migrate".into())
            .spawn(move || shared.run())
            .expect("failed to spawn migration thread");
        MigrationHandle {
            shared: Arc::clone(&self.shared),
            thread: Some(thread),
        }
    }

    /// Runs the whole migration on the calling thread.
    pub fn run(&self) {
        self.shared.run();
    }

    /// True while a pass is executing (or has not yet been given the chance
    /// to). Retrieval work is queued only once this clears.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True if the last pass aborted on a store error. A failed migrator
    /// stays stopped; a fresh instance is needed to retry.
    pub fn stopped_with_error(&self) -> bool {
        self.shared.stopped_with_error.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn progress(&self) -> MigrationProgress {
        self.shared.progress_snapshot(if self.stopped_with_error() {
            MigrationPhase::Failed
        } else {
            MigrationPhase::Complete
        })
    }
}

impl MigratorShared {
    fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let outcome = self.run_phases();
        match outcome {
            Ok(()) => {
                if self.started_notified.load(Ordering::SeqCst) {
                    if self.stop.load(Ordering::SeqCst) {
                        // A cooperative stop leaves unconverted rows behind;
                        // do not report the pass as finished.
                        warn!(
                            converted = self.converted.load(Ordering::Relaxed),
                            deleted = self.deleted.load(Ordering::Relaxed),
                            "migrate.stopped_before_complete"
                        );
                        self.notify(|sink| sink.migration_stopped());
                    } else {
                        info!(
                            converted = self.converted.load(Ordering::Relaxed),
                            deleted = self.deleted.load(Ordering::Relaxed),
                            failed = self.failed.load(Ordering::Relaxed),
                            "migrate.finished"
                        );
                        self.notify(|sink| sink.migration_finished());
                    }
                }
            }
            Err(err) => {
                self.stopped_with_error.store(true, Ordering::SeqCst);
                warn!(error = %err, "migrate.stopped_with_error");
                let message = err.to_string();
                self.notify(|sink| sink.migration_failed(&message));
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn run_phases(&self) -> crate::error::Result<()> {
        let store = self.repo.store();
        let unused = store.count_unused()?;
        let legacy = store.count_legacy()?;
        if unused == 0 && legacy == 0 {
            debug!("migrate.nothing_to_do");
            return Ok(());
        }

        info!(unused, legacy, "migrate.starting");
        self.notify_started_once();
        self.prune_unused()?;
        self.convert_legacy()?;
        Ok(())
    }

    fn notify_started_once(&self) {
        if !self.started_notified.swap(true, Ordering::SeqCst) {
            self.notify(|sink| sink.migration_started());
        }
    }

    /// Phase one: bulk-delete unreferenced legacy rows. Each batch sleeps
    /// for half the time the delete took, keeping the store responsive to
    /// foreground reads.
    fn prune_unused(&self) -> crate::error::Result<()> {
        let store = self.repo.store();
        let batch_size = self.repo.options().migration_prune_batch_size;
        while !self.stop.load(Ordering::SeqCst) {
            let batch = store.list_unused(batch_size)?;
            if batch.is_empty() {
                break;
            }

            let started = Instant::now();
            store.delete_many(&batch)?;
            self.deleted.fetch_add(batch.len() as u64, Ordering::Relaxed);

            let remaining = store.count_unused()?;
            debug!(deleted = batch.len(), remaining, "migrate.prune.batch");
            let progress = self.progress_with_remaining(MigrationPhase::Pruning, remaining);
            self.notify(|sink| sink.migration_progress(&progress));

            thread::sleep(started.elapsed() / 2);
        }
        Ok(())
    }

    /// Phase two: decode each remaining legacy row, push it through the
    /// updater with its parent flag raised, and drop the legacy row once
    /// the asynchronous write settles.
    fn convert_legacy(&self) -> crate::error::Result<()> {
        let store = self.repo.store();
        let options = self.repo.options();
        let batch_size = options.migration_batch_size;
        let batch_timeout = options.migration_batch_timeout;

        while !self.stop.load(Ordering::SeqCst) {
            let batch = store.legacy_batch(batch_size)?;
            if batch.is_empty() {
                break;
            }

            let deadline = Instant::now() + batch_timeout;
            let mut pending: Vec<(SectionPos, crate::workers::TaskHandle)> = Vec::new();
            for record in batch {
                if self.stop.load(Ordering::SeqCst) {
                    return Ok(());
                }
                match record.to_node(self.repo.pool()) {
                    Ok(node) => {
                        // A converted row is an ordinary write: the updater
                        // flags it for up-propagation when it changed.
                        let handle = self.updater.update_async(node);
                        pending.push((record.pos, handle));
                    }
                    Err(err) => {
                        warn!(pos = %record.pos, error = %err, "migrate.convert.failed_row");
                        store.mark_migration_failed(record.pos)?;
                        self.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            let mut batch_progressed = pending.is_empty();
            for (pos, handle) in pending {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if handle.wait_timeout(remaining.max(Duration::from_millis(1))) {
                    store.delete_legacy(pos)?;
                    self.converted.fetch_add(1, Ordering::Relaxed);
                    batch_progressed = true;
                } else {
                    // Row survives and is retried with the next batch.
                    warn!(pos = %pos, "migrate.convert.timed_out");
                }
            }

            if !batch_progressed {
                // Timeouts are transient (a stalled pool, a slow store);
                // the same rows are re-fetched and retried next iteration.
                warn!(
                    error = %StoreError::Timeout("legacy conversion batch"),
                    "migrate.convert.stalled"
                );
                continue;
            }

            let remaining = store.count_legacy()?;
            let progress = self.progress_with_remaining(MigrationPhase::Converting, remaining);
            self.notify(|sink| sink.migration_progress(&progress));
        }
        Ok(())
    }

    fn notify(&self, deliver: impl Fn(&dyn NotificationSink)) {
        if let Some(sink) = &self.repo.options().notifications {
            deliver(sink.as_ref());
        }
    }

    fn progress_snapshot(&self, phase: MigrationPhase) -> MigrationProgress {
        self.progress_with_remaining(phase, 0)
    }

    fn progress_with_remaining(&self, phase: MigrationPhase, remaining: u64) -> MigrationProgress {
        MigrationProgress {
            phase,
            deleted: self.deleted.load(Ordering::Relaxed),
            converted: self.converted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            remaining,
        }
    }
}

/// Owner handle for the migration thread. Dropping it requests a stop and
/// joins; in-flight batches finish first.
pub struct MigrationHandle {
    shared: Arc<MigratorShared>,
    thread: Option<JoinHandle<()>>,
}

impl MigrationHandle {
    pub fn stop(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MigrationHandle {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
