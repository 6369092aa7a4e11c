//! Persistence and consistency engine for hierarchical level-of-detail
//! terrain data.
//!
//! Nodes live in a quadtree keyed by [`SectionPos`]; every write is merged
//! into the stored node and flagged so a background scheduler propagates the
//! change to coarser (and optionally finer) levels until the tree settles.
//! [`DataSourceProvider`] owns the whole stack; embedders bring a
//! [`NodeStore`] implementation or use the in-memory one.

pub mod error;
pub mod locks;
pub mod migrate;
pub mod node;
pub mod options;
pub mod pool;
pub mod pos;
pub mod propagator;
pub mod provider;
pub mod record;
pub mod repo;
pub mod store;
pub mod updater;
pub mod workers;

/// Crate-wide error and result types.
pub use error::{Result, StoreError};

/// Quadtree addressing.
pub use pos::{SectionPos, LEAF_DETAIL_LEVEL, ROOT_DETAIL_LEVEL};

/// In-memory node representation.
pub use node::{DataColumn, Direction, LodNode, GRID_WIDTH};

/// Node reuse pool.
pub use pool::{NodePool, PooledNode};

/// Serialized record format.
pub use record::{CompressionMode, FormatVersion, NodeRecord};

/// Storage contract and the reference in-memory implementation.
pub use store::{MemoryNodeStore, NodeStore};

/// Repository facade over a store.
pub use repo::NodeRepo;

/// Write path.
pub use updater::{NodeUpdater, UpdateListener};

/// Background consistency propagation.
pub use propagator::{PropagationHandle, PropagationScheduler, Viewpoint};

/// Legacy-format migration.
pub use migrate::{
    LegacyMigrator, MigrationHandle, MigrationPhase, MigrationProgress, NotificationSink,
    NullNotificationSink,
};

/// Top-level provider and configuration.
pub use options::StoreOptions;
pub use provider::{DataSourceProvider, RetrievalSource};

/// Keyed lock registry and worker pool primitives.
pub use locks::PositionLocks;
pub use workers::{TaskHandle, WorkerPool};
