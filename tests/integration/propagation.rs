//! Consistency propagation integration tests.
//!
//! These tests verify:
//! - A leaf-adjacent write bubbles all the way to the root level
//! - Down-propagation fills holes without overwriting real data
//! - Randomized concurrent up/down merge traffic settles without deadlock
//! - The background loop thread starts and stops cleanly

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::smallvec;
use tracing_subscriber::EnvFilter;

use lodstore::{
    CompressionMode, DataSourceProvider, MemoryNodeStore, NodeStore, SectionPos, StoreOptions,
    LEAF_DETAIL_LEVEL, ROOT_DETAIL_LEVEL,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("lodstore=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn provider(options: StoreOptions) -> (DataSourceProvider, Arc<MemoryNodeStore>) {
    init_tracing();
    let store = Arc::new(MemoryNodeStore::new());
    let provider = DataSourceProvider::new(store.clone() as Arc<dyn NodeStore>, options);
    (provider, store)
}

/// Drives wake cycles until a cycle schedules nothing, or panics at the
/// deadline.
fn settle(provider: &DataSourceProvider, deadline: Duration) {
    let give_up = Instant::now() + deadline;
    loop {
        let handles = provider.run_propagation_cycle();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            assert!(
                handle.wait_timeout(Duration::from_secs(30)),
                "merge task never resolved"
            );
        }
        assert!(Instant::now() < give_up, "propagation never settled");
    }
}

#[test]
fn child_write_bubbles_to_root() {
    let (provider, store) = provider(
        StoreOptions::default()
            .compression(CompressionMode::None)
            .worker_threads(2),
    );
    let start_detail = 6;
    let child = SectionPos::new(start_detail, 5, 9);

    let mut node = provider.repo().pool().acquire(child);
    node.set_column(0, 0, smallvec![0xBEEF], 1, 0);
    assert!(provider.update(node).wait_timeout(Duration::from_secs(10)));

    settle(&provider, Duration::from_secs(60));

    // Every ancestor up to the root now holds downsampled data and no
    // pending flags remain anywhere on the chain.
    let mut pos = child;
    while pos.detail_level() < ROOT_DETAIL_LEVEL {
        let parent = pos.parent();
        assert!(store.contains(parent), "ancestor {parent} missing");
        let ancestor = provider.get(parent).unwrap();
        assert!(!ancestor.is_empty(), "ancestor {parent} empty");
        assert_eq!(store.parent_flag(pos), Some(false), "flag left on {pos}");
        pos = parent;
    }
    assert_eq!(store.parent_flag(pos), Some(false), "root still flagged");
    provider.close();
}

#[test]
fn down_propagation_fills_holes_but_keeps_real_data() {
    let (provider, store) = provider(
        StoreOptions::default()
            .compression(CompressionMode::None)
            .fill_holes_with_parent_data(true)
            .worker_threads(2),
    );
    let parent = SectionPos::new(1, 0, 0);
    let child = parent.child(0);

    // The child already has one real column; the parent is fully populated
    // and flagged downward.
    let mut child_node = provider.repo().pool().acquire(child);
    child_node.set_column(0, 0, smallvec![111], 1, 0);
    assert!(provider
        .update(child_node)
        .wait_timeout(Duration::from_secs(10)));

    let mut parent_node = provider.repo().pool().acquire(parent);
    for z in 0..lodstore::GRID_WIDTH {
        for x in 0..lodstore::GRID_WIDTH {
            parent_node.set_column(x, z, smallvec![222], 1, 0);
        }
    }
    parent_node.apply_to_children = true;
    assert!(provider
        .update(parent_node)
        .wait_timeout(Duration::from_secs(10)));

    settle(&provider, Duration::from_secs(60));

    let filled = provider.get(child).unwrap();
    assert_eq!(
        filled.column(0, 0).as_slice(),
        &[111],
        "hole filling must not overwrite real data"
    );
    // Sampled away from the quadrant cell the child's own write bubbled
    // into, so the fill source is still the seeded parent data.
    assert_eq!(filled.column(10, 10).as_slice(), &[222], "hole was not filled");
    assert_eq!(store.children_flag(parent), Some(false));
    provider.close();
}

#[test]
fn randomized_bidirectional_traffic_settles_without_deadlock() {
    let (provider, _store) = provider(
        StoreOptions::default()
            .compression(CompressionMode::None)
            .fill_holes_with_parent_data(true)
            .worker_threads(4),
    );
    let provider = Arc::new(provider);
    let mut rng = ChaCha8Rng::seed_from_u64(0x10D);

    // Seed a spread of positions across detail levels, some flagged both
    // directions at once.
    for _ in 0..200 {
        let detail =
            rng.gen_range(LEAF_DETAIL_LEVEL + 1..ROOT_DETAIL_LEVEL);
        let span = 1i32 << (ROOT_DETAIL_LEVEL - detail).min(6);
        let pos = SectionPos::new(detail, rng.gen_range(-span..span), rng.gen_range(-span..span));
        let mut node = provider.repo().pool().acquire(pos);
        let x = rng.gen_range(0..lodstore::GRID_WIDTH);
        let z = rng.gen_range(0..lodstore::GRID_WIDTH);
        node.set_column(x, z, smallvec![rng.gen()], 1, 0);
        node.apply_to_children = rng.gen_bool(0.3);
        provider.update(node);
    }

    // Foreground writers race the merge cycles.
    let writers: Vec<_> = (0..4)
        .map(|seed| {
            let provider = Arc::clone(&provider);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for _ in 0..100 {
                    let detail = rng.gen_range(LEAF_DETAIL_LEVEL..ROOT_DETAIL_LEVEL);
                    let pos = SectionPos::new(detail, rng.gen_range(-4..4), rng.gen_range(-4..4));
                    let mut node = provider.repo().pool().acquire(pos);
                    node.set_column(0, 0, smallvec![rng.gen()], 1, 0);
                    provider.update(node);
                }
            })
        })
        .collect();

    let give_up = Instant::now() + Duration::from_secs(120);
    loop {
        let handles = provider.run_propagation_cycle();
        let idle = handles.is_empty();
        for handle in handles {
            assert!(handle.wait_timeout(Duration::from_secs(30)));
        }
        if idle && writers.iter().all(|w| w.is_finished()) {
            break;
        }
        assert!(Instant::now() < give_up, "traffic never settled");
    }
    for writer in writers {
        writer.join().unwrap();
    }

    // Writer-submitted update tasks may still be draining; a wedged lock
    // would keep this set populated forever.
    while !provider.locked_positions().is_empty() {
        assert!(Instant::now() < give_up, "position locks never released");
        thread::sleep(Duration::from_millis(1));
    }
    provider.close();
}

#[test]
fn background_loop_runs_and_stops() {
    let (provider, store) = provider(
        StoreOptions::default()
            .compression(CompressionMode::None)
            .propagate_interval(Duration::from_millis(10))
            .worker_threads(2),
    );
    provider.start();

    let child = SectionPos::new(3, 1, 1);
    let mut node = provider.repo().pool().acquire(child);
    node.set_column(0, 0, smallvec![9], 1, 0);
    assert!(provider.update(node).wait_timeout(Duration::from_secs(10)));

    // The loop thread picks the flag up on its own.
    let deadline = Instant::now() + Duration::from_secs(30);
    while store.parent_flag(child) != Some(false) {
        assert!(Instant::now() < deadline, "loop never merged the child");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(store.contains(child.parent()));

    // Close joins the loop thread; reaching the end without hanging is the
    // assertion.
    provider.close();
}
