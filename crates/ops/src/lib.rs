//! Low-downtime PostgreSQL maintenance operations.
//!
//! This crate is the engine behind Steward: schema maintenance against a
//! live production cluster, designed to cooperate with concurrent traffic.
//! - Retryable lock acquisition with an escalating timeout schedule
//! - Batched and probabilistic counting over very large tables
//! - Rolling consistency audits between related tables
//! - Concurrent index rebuilds with atomic name swaps
//! - Allow-listed partition attach/detach/truncate
//! - Schema drift, collation corruption, and duplicate-key repair
//! - Resumable depth-first iteration over hierarchical tables
//!
//! Components hold no global state: every operation receives its connection
//! pool (or borrows a connection) explicitly, reads catalog state fresh, and
//! returns a structured report instead of printing. Expected transient
//! failures (lock waits, statement cancellation) are typed and handled;
//! everything else propagates after cleanup.

pub mod advisory_lock;
pub mod batch_count;
pub mod catalog;
pub mod collation;
pub mod consistency;
pub mod error;
pub mod hll;
pub mod lock_retries;
pub mod loose_index_scan;
pub mod partition;
pub mod reindex;
pub mod repair_index;
pub mod schema_check;
pub mod session;
pub mod sql;
pub mod tree_batch;

pub use advisory_lock::AdvisoryLock;
pub use batch_count::{BatchAverageCounter, BatchCounter};
pub use collation::{CollationChecker, CollationReport};
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use error::{OpsError, OpsResult};
pub use hll::{HllBatchDistinctCounter, HllSketch};
pub use lock_retries::WithLockRetries;
pub use loose_index_scan::LooseIndexScanDistinctCount;
pub use partition::{AlterPartition, PartitionMode, TruncatePartition};
pub use reindex::ConcurrentReindex;
pub use repair_index::{RepairIndex, RepairReport};
pub use schema_check::{SchemaChecker, SchemaReport};
pub use tree_batch::{TreeBatchIterator, TreeCursor};
