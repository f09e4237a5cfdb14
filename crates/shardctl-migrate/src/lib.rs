//! # shardctl-migrate
//!
//! Live migration of restaurant data between shards.
//!
//! - `ShardMigration`: the migration state machine and batched table copy
//! - `DualWriteCoordinator`: leader/follower writes while a migration runs
//! - `ProgressTracker`: progress counters readable while a run is active
//! - `MigrationRegistry`: background runs addressable by migration id

pub mod dual_write;
pub mod migration;
pub mod progress;
pub mod registry;

// Re-export core types
pub use shardctl_core::*;

pub use dual_write::{DualWriteConfig, DualWriteCoordinator, DualWriteStats};
pub use migration::ShardMigration;
pub use progress::ProgressTracker;
pub use registry::{MigrationRegistry, MigrationStatus};
