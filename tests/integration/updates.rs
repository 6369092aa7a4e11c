//! Write-path integration tests.
//!
//! These tests verify:
//! - Concurrent updates to one position never lose a write
//! - Re-applying identical data is a no-op write
//! - Listeners fire only when a persisted change occurred
//! - The keyed lock registry hands out one lock object per position

#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use smallvec::smallvec;

use lodstore::{
    CompressionMode, DataSourceProvider, LodNode, MemoryNodeStore, NodeStore, PositionLocks,
    SectionPos, StoreOptions, UpdateListener,
};

fn provider() -> (DataSourceProvider, Arc<MemoryNodeStore>) {
    let store = Arc::new(MemoryNodeStore::new());
    let options = StoreOptions::default()
        .compression(CompressionMode::None)
        .worker_threads(4);
    let provider = DataSourceProvider::new(store.clone() as Arc<dyn NodeStore>, options);
    (provider, store)
}

struct CountingListener {
    notified: AtomicUsize,
}

impl UpdateListener for CountingListener {
    fn on_node_updated(&self, _node: &LodNode) {
        self.notified.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_updates_to_one_position_lose_nothing() {
    let (provider, _store) = provider();
    let provider = Arc::new(provider);
    let pos = SectionPos::new(0, 10, -10);

    // Each thread owns a distinct cell; a lost update would leave its cell
    // empty in the final node.
    let threads: Vec<_> = (0..32)
        .map(|i| {
            let provider = Arc::clone(&provider);
            thread::spawn(move || {
                let mut node = provider.repo().pool().acquire(pos);
                node.set_column(i, i, smallvec![i as u64 + 1], 1, 0);
                assert!(provider.update(node).wait_timeout(Duration::from_secs(30)));
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    let merged = provider.get(pos).unwrap();
    for i in 0..32 {
        assert_eq!(
            merged.column(i, i).as_slice(),
            &[i as u64 + 1],
            "cell ({i}, {i}) lost its write"
        );
    }
    provider.close();
}

#[test]
fn identical_update_does_not_rewrite() {
    let (provider, store) = provider();
    let pos = SectionPos::new(2, 0, 0);

    let mut node = provider.repo().pool().acquire(pos);
    node.set_column(3, 3, smallvec![77], 1, 0);
    assert!(provider.update(node).wait_timeout(Duration::from_secs(10)));
    let first_write = store.get_record(pos).unwrap().unwrap().last_modified_unix_ms;

    // Give the clock room to move, then replay the same data.
    thread::sleep(Duration::from_millis(5));
    let mut replay = provider.repo().pool().acquire(pos);
    replay.set_column(3, 3, smallvec![77], 1, 0);
    assert!(provider.update(replay).wait_timeout(Duration::from_secs(10)));

    let second_write = store.get_record(pos).unwrap().unwrap().last_modified_unix_ms;
    assert_eq!(first_write, second_write, "no-change update must not persist");
    provider.close();
}

#[test]
fn listener_fires_only_on_persisted_change() {
    let (provider, _store) = provider();
    let listener = Arc::new(CountingListener {
        notified: AtomicUsize::new(0),
    });
    provider.add_listener(listener.clone());
    let pos = SectionPos::new(1, 4, 4);

    let mut node = provider.repo().pool().acquire(pos);
    node.set_column(0, 0, smallvec![5], 1, 0);
    assert!(provider.update(node).wait_timeout(Duration::from_secs(10)));
    assert_eq!(listener.notified.load(Ordering::SeqCst), 1);

    let mut replay = provider.repo().pool().acquire(pos);
    replay.set_column(0, 0, smallvec![5], 1, 0);
    assert!(provider.update(replay).wait_timeout(Duration::from_secs(10)));
    assert_eq!(
        listener.notified.load(Ordering::SeqCst),
        1,
        "no-change update must not notify"
    );
    provider.close();
}

#[test]
fn lock_registry_returns_one_lock_per_position() {
    let locks = PositionLocks::new();
    let pos = SectionPos::new(4, -7, 13);
    let other = SectionPos::new(4, -7, 14);

    let a = locks.get_lock(pos);
    let b = locks.get_lock(pos);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &locks.get_lock(other)));

    // A held lock serializes a competing locker.
    let guard = a.lock();
    let contender = {
        let locks = Arc::clone(&locks);
        thread::spawn(move || {
            let lock = locks.get_lock(pos);
            let _guard = lock.lock();
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!contender.is_finished());
    drop(guard);
    contender.join().unwrap();
}

#[test]
fn queued_count_tracks_and_clears() {
    let (provider, _store) = provider();
    let pos = SectionPos::new(0, 0, 0);

    let mut node = provider.repo().pool().acquire(pos);
    node.set_column(0, 0, smallvec![1], 1, 0);
    let handle = provider.update(node);
    assert!(handle.wait_timeout(Duration::from_secs(10)));

    // Counts are transient; once every handle resolved the position drains
    // back to zero.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while provider.queued_update_count(pos) != 0 {
        assert!(std::time::Instant::now() < deadline, "queued count never drained");
        thread::sleep(Duration::from_millis(1));
    }
    provider.close();
}
