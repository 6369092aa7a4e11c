use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Result, StoreError};
use crate::node::Direction;
use crate::pos::SectionPos;
use crate::record::NodeRecord;

/// Durable key-to-record storage consumed by the repository, updater,
/// propagation scheduler and migrator. Treated as ground truth.
///
/// Implementations must be safe to call from multiple worker threads; the
/// callers serialize per-position mutation through the lock registry, not
/// through the store.
pub trait NodeStore: Send + Sync {
    fn get_record(&self, pos: SectionPos) -> Result<Option<NodeRecord>>;

    /// Inserts or replaces the record for its position. An `Option` flag of
    /// `None` on the record leaves the stored propagation flag untouched.
    fn save(&self, record: NodeRecord) -> Result<()>;

    fn delete(&self, pos: SectionPos) -> Result<()>;

    /// Returns the record backing a single-direction border read. A store
    /// with per-direction blobs may return a trimmed record; returning the
    /// full record is also valid.
    fn get_adjacent_record(&self, pos: SectionPos, direction: Direction)
        -> Result<Option<NodeRecord>>;

    fn timestamp_for(&self, pos: SectionPos) -> Result<Option<u64>>;

    /// Positions flagged `apply_to_parent`, ordered by proximity to the
    /// reference point, at most `limit`.
    fn positions_needing_parent_merge(
        &self,
        ref_x: i64,
        ref_z: i64,
        limit: usize,
    ) -> Result<Vec<SectionPos>>;

    /// Positions flagged `apply_to_children`, ordered by proximity to the
    /// reference point, at most `limit`.
    fn positions_needing_child_merge(
        &self,
        ref_x: i64,
        ref_z: i64,
        limit: usize,
    ) -> Result<Vec<SectionPos>>;

    fn clear_parent_flag(&self, pos: SectionPos) -> Result<()>;

    fn clear_children_flag(&self, pos: SectionPos) -> Result<()>;

    // Legacy-format side, consumed by the migrator.

    /// Number of legacy rows that are no longer referenced and can simply be
    /// deleted.
    fn count_unused(&self) -> Result<u64>;

    fn list_unused(&self, limit: usize) -> Result<Vec<SectionPos>>;

    fn delete_many(&self, keys: &[SectionPos]) -> Result<()>;

    /// Number of legacy rows still awaiting conversion.
    fn count_legacy(&self) -> Result<u64>;

    /// A bounded batch of legacy records awaiting conversion. Rows stay in
    /// this set until [`NodeStore::delete_legacy`] or
    /// [`NodeStore::mark_migration_failed`] removes them.
    fn legacy_batch(&self, limit: usize) -> Result<Vec<NodeRecord>>;

    fn delete_legacy(&self, pos: SectionPos) -> Result<()>;

    fn mark_migration_failed(&self, pos: SectionPos) -> Result<()>;
}

struct StoredRow {
    record: NodeRecord,
    apply_to_parent: bool,
    apply_to_children: bool,
}

struct LegacyRow {
    record: NodeRecord,
    unused: bool,
    migration_failed: bool,
}

/// Process-local [`NodeStore`] backed by hash maps.
///
/// The reference implementation used by the test suite and by embedders that
/// do not bring their own SQL-backed store.
#[derive(Default)]
pub struct MemoryNodeStore {
    rows: RwLock<FxHashMap<SectionPos, StoredRow>>,
    legacy: RwLock<FxHashMap<SectionPos, LegacyRow>>,
    fail_reads: AtomicBool,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a legacy-format row. `unused` rows are prune candidates; the
    /// rest await conversion.
    pub fn insert_legacy(&self, record: NodeRecord, unused: bool) {
        self.legacy.write().insert(
            record.pos,
            LegacyRow {
                record,
                unused,
                migration_failed: false,
            },
        );
    }

    /// Seeds a current-format row directly, bypassing flag merging.
    pub fn insert_record(&self, record: NodeRecord) {
        let apply_to_parent = record.apply_to_parent.unwrap_or(false);
        let apply_to_children = record.apply_to_children.unwrap_or(false);
        self.rows.write().insert(
            record.pos,
            StoredRow {
                record,
                apply_to_parent,
                apply_to_children,
            },
        );
    }

    /// Makes every read fail with an I/O error; used to exercise the
    /// log-once unavailable path.
    pub fn set_read_errors(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, pos: SectionPos) -> bool {
        self.rows.read().contains_key(&pos)
    }

    pub fn parent_flag(&self, pos: SectionPos) -> Option<bool> {
        self.rows.read().get(&pos).map(|row| row.apply_to_parent)
    }

    pub fn children_flag(&self, pos: SectionPos) -> Option<bool> {
        self.rows.read().get(&pos).map(|row| row.apply_to_children)
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected read failure",
            )));
        }
        Ok(())
    }
}

fn nearest_first(mut positions: Vec<SectionPos>, ref_x: i64, ref_z: i64, limit: usize) -> Vec<SectionPos> {
    positions.sort_by_key(|pos| {
        let (cx, cz) = pos.center();
        let (dx, dz) = (cx - ref_x, cz - ref_z);
        (dx * dx + dz * dz, pos.raw())
    });
    positions.truncate(limit);
    positions
}

impl NodeStore for MemoryNodeStore {
    fn get_record(&self, pos: SectionPos) -> Result<Option<NodeRecord>> {
        self.check_read()?;
        Ok(self.rows.read().get(&pos).map(|row| row.record.clone()))
    }

    fn save(&self, record: NodeRecord) -> Result<()> {
        let mut rows = self.rows.write();
        match rows.get_mut(&record.pos) {
            Some(row) => {
                if let Some(flag) = record.apply_to_parent {
                    row.apply_to_parent = flag;
                }
                if let Some(flag) = record.apply_to_children {
                    row.apply_to_children = flag;
                }
                let created = row.record.created_unix_ms;
                row.record = record;
                row.record.created_unix_ms = created;
            }
            None => {
                let apply_to_parent = record.apply_to_parent.unwrap_or(false);
                let apply_to_children = record.apply_to_children.unwrap_or(false);
                rows.insert(
                    record.pos,
                    StoredRow {
                        record,
                        apply_to_parent,
                        apply_to_children,
                    },
                );
            }
        }
        Ok(())
    }

    fn delete(&self, pos: SectionPos) -> Result<()> {
        self.rows.write().remove(&pos);
        Ok(())
    }

    fn get_adjacent_record(
        &self,
        pos: SectionPos,
        _direction: Direction,
    ) -> Result<Option<NodeRecord>> {
        // The in-memory store keeps whole records, so a border read returns
        // the full record and lets the repo trim it.
        self.get_record(pos)
    }

    fn timestamp_for(&self, pos: SectionPos) -> Result<Option<u64>> {
        self.check_read()?;
        Ok(self
            .rows
            .read()
            .get(&pos)
            .map(|row| row.record.last_modified_unix_ms))
    }

    fn positions_needing_parent_merge(
        &self,
        ref_x: i64,
        ref_z: i64,
        limit: usize,
    ) -> Result<Vec<SectionPos>> {
        let flagged = self
            .rows
            .read()
            .iter()
            .filter(|(_, row)| row.apply_to_parent)
            .map(|(pos, _)| *pos)
            .collect();
        Ok(nearest_first(flagged, ref_x, ref_z, limit))
    }

    fn positions_needing_child_merge(
        &self,
        ref_x: i64,
        ref_z: i64,
        limit: usize,
    ) -> Result<Vec<SectionPos>> {
        let flagged = self
            .rows
            .read()
            .iter()
            .filter(|(_, row)| row.apply_to_children)
            .map(|(pos, _)| *pos)
            .collect();
        Ok(nearest_first(flagged, ref_x, ref_z, limit))
    }

    fn clear_parent_flag(&self, pos: SectionPos) -> Result<()> {
        if let Some(row) = self.rows.write().get_mut(&pos) {
            row.apply_to_parent = false;
        }
        Ok(())
    }

    fn clear_children_flag(&self, pos: SectionPos) -> Result<()> {
        if let Some(row) = self.rows.write().get_mut(&pos) {
            row.apply_to_children = false;
        }
        Ok(())
    }

    fn count_unused(&self) -> Result<u64> {
        Ok(self
            .legacy
            .read()
            .values()
            .filter(|row| row.unused)
            .count() as u64)
    }

    fn list_unused(&self, limit: usize) -> Result<Vec<SectionPos>> {
        Ok(self
            .legacy
            .read()
            .iter()
            .filter(|(_, row)| row.unused)
            .map(|(pos, _)| *pos)
            .take(limit)
            .collect())
    }

    fn delete_many(&self, keys: &[SectionPos]) -> Result<()> {
        let mut legacy = self.legacy.write();
        for key in keys {
            legacy.remove(key);
        }
        Ok(())
    }

    fn count_legacy(&self) -> Result<u64> {
        Ok(self
            .legacy
            .read()
            .values()
            .filter(|row| !row.unused && !row.migration_failed)
            .count() as u64)
    }

    fn legacy_batch(&self, limit: usize) -> Result<Vec<NodeRecord>> {
        Ok(self
            .legacy
            .read()
            .values()
            .filter(|row| !row.unused && !row.migration_failed)
            .take(limit)
            .map(|row| row.record.clone())
            .collect())
    }

    fn delete_legacy(&self, pos: SectionPos) -> Result<()> {
        self.legacy.write().remove(&pos);
        Ok(())
    }

    fn mark_migration_failed(&self, pos: SectionPos) -> Result<()> {
        if let Some(row) = self.legacy.write().get_mut(&pos) {
            row.migration_failed = true;
        }
        Ok(())
    }
}
