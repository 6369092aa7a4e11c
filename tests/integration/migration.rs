//! Legacy-format migration integration tests.
//!
//! These tests verify:
//! - A store holding only legacy rows drains fully through the provider
//! - Retrieval queueing stays gated until migration finishes
//! - Rows that cannot be decoded are marked failed and skipped, not retried
//! - Converted data participates in up-propagation like a fresh write

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use smallvec::smallvec;

use lodstore::{
    CompressionMode, DataSourceProvider, LodNode, MemoryNodeStore, NodeRecord, NodeStore,
    RetrievalSource, SectionPos, StoreOptions,
};

#[derive(Default)]
struct RecordingSource {
    requests: AtomicUsize,
}

impl RetrievalSource for RecordingSource {
    fn request(&self, _pos: SectionPos) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

fn legacy_record(pos: SectionPos, value: u64) -> NodeRecord {
    let mut node = LodNode::empty(pos);
    node.set_column(0, 0, smallvec![value], 1, 0);
    NodeRecord::legacy_from_node(&node, CompressionMode::None).unwrap()
}

fn wait_for_migration(provider: &DataSourceProvider) {
    let deadline = Instant::now() + Duration::from_secs(60);
    while provider.migration_in_progress() {
        assert!(Instant::now() < deadline, "migration never finished");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn legacy_only_store_drains_completely() {
    let store = Arc::new(MemoryNodeStore::new());
    for i in 0..23 {
        store.insert_legacy(legacy_record(SectionPos::new(0, i, 0), i as u64 + 1), false);
    }
    for i in 0..7 {
        store.insert_legacy(legacy_record(SectionPos::new(0, i, 50), 1), true);
    }

    let provider = DataSourceProvider::new(
        store.clone() as Arc<dyn NodeStore>,
        StoreOptions::default()
            .compression(CompressionMode::None)
            .worker_threads(2)
            // Keep the propagation loop quiet so the raised flags are
            // observable.
            .propagate_interval(Duration::from_secs(3600)),
    );
    provider.start();
    wait_for_migration(&provider);

    assert_eq!(store.count_legacy().unwrap(), 0);
    assert_eq!(store.count_unused().unwrap(), 0);
    for i in 0..23 {
        let pos = SectionPos::new(0, i, 0);
        assert!(store.contains(pos), "converted row {pos} missing");
        assert_eq!(
            store.parent_flag(pos),
            Some(true),
            "converted row {pos} must re-enter propagation"
        );
    }
    // Pruned rows were deleted, never converted.
    for i in 0..7 {
        assert!(!store.contains(SectionPos::new(0, i, 50)));
    }
    provider.close();
}

#[test]
fn retrieval_gate_opens_after_migration() {
    let store = Arc::new(MemoryNodeStore::new());
    store.insert_legacy(legacy_record(SectionPos::new(0, 0, 0), 1), false);
    let source = Arc::new(RecordingSource::default());

    let provider = DataSourceProvider::new(
        store as Arc<dyn NodeStore>,
        StoreOptions::default()
            .compression(CompressionMode::None)
            .retrieval(source.clone()),
    );
    assert!(
        !provider.can_queue_retrieval(),
        "gate must stay closed before the pass has run"
    );

    provider.start();
    wait_for_migration(&provider);

    assert!(provider.can_queue_retrieval());
    assert!(provider.queue_retrieval(SectionPos::new(0, 2, 2)));
    assert_eq!(source.requests.load(Ordering::SeqCst), 1);
    provider.close();
    assert!(!provider.can_queue_retrieval(), "gate closes again on shutdown");
}

#[test]
fn undecodable_rows_are_marked_failed_and_skipped() {
    let store = Arc::new(MemoryNodeStore::new());
    let good = SectionPos::new(0, 1, 0);
    let bad = SectionPos::new(0, 2, 0);
    store.insert_legacy(legacy_record(good, 10), false);
    let mut corrupt = legacy_record(bad, 20);
    corrupt.data_checksum ^= 0xFFFF_FFFF;
    store.insert_legacy(corrupt, false);

    let provider = DataSourceProvider::new(
        store.clone() as Arc<dyn NodeStore>,
        StoreOptions::default().compression(CompressionMode::None),
    );
    provider.start();
    wait_for_migration(&provider);

    assert!(store.contains(good));
    assert!(!store.contains(bad), "corrupt row must not convert");
    assert_eq!(
        store.count_legacy().unwrap(),
        0,
        "failed row must leave the pending queue"
    );
    assert_eq!(provider.migration_progress().failed, 1);
    provider.close();
}

#[test]
fn converted_rows_bubble_upward() {
    let store = Arc::new(MemoryNodeStore::new());
    let leaf = SectionPos::new(0, 3, 3);
    store.insert_legacy(legacy_record(leaf, 42), false);

    let provider = DataSourceProvider::new(
        store.clone() as Arc<dyn NodeStore>,
        StoreOptions::default()
            .compression(CompressionMode::None)
            .worker_threads(2)
            // Drive propagation manually below instead of racing the loop.
            .propagate_interval(Duration::from_secs(3600)),
    );
    provider.start();
    wait_for_migration(&provider);

    // Drive propagation to a fixed point.
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let handles = provider.run_propagation_cycle();
        if handles.is_empty() {
            break;
        }
        for handle in handles {
            assert!(handle.wait_timeout(Duration::from_secs(30)));
        }
        assert!(Instant::now() < deadline, "propagation never settled");
    }

    assert!(store.contains(leaf.parent()), "converted data never bubbled");
    provider.close();
}
