//! # shardctl-core
//!
//! Core types, traits, and abstractions for the shardctl control plane.
//!
//! This crate provides the shard and migration data model, the shared error
//! type, the jump consistent hash, SQL builders for table-generic copies, and
//! the `ShardConnection`/`ShardConnector` traits that the router, migration
//! and health crates are written against.
//!
//! ## Logging
//!
//! All crates log through `tracing` with the same structured field names
//! (`subsystem`, `component`, `op`, `shard_id`, `shard_number`, `db_table`,
//! `duration_ms`, ...) and one level contract:
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Shard unhealthy or migration failed, requires operator attention |
//! | WARN  | Recoverable issue: skipped row, lost follower write, degraded shard |
//! | INFO  | Lifecycle events: phase changes, checker start/stop, completions |
//! | DEBUG | Decision points, batch boundaries, cache hits/misses |
//! | TRACE | Per-row iteration |

pub mod defaults;
pub mod error;
pub mod hash;
pub mod models;
pub mod sql;
pub mod topology;
pub mod traits;
pub mod value;

#[cfg(feature = "mock")]
pub mod mock;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use hash::jump_hash;
pub use models::*;
pub use topology::ShardTopology;
pub use traits::*;
pub use value::{ColumnMeta, ConflictPolicy, Row, RowBatch, SqlValue};
