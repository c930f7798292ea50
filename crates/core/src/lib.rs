//! Core configuration and shared types for Steward.
//!
//! This crate defines the canonical configuration model used across the
//! workspace:
//! - Database targets (a deployment may span several logical databases)
//! - The lock retry schedule value object
//! - Partition allow-list entries
//! - Index repair plans
//! - Expected-schema and collation check inputs
//!
//! Nothing in this crate touches a database; `steward_ops` consumes these
//! types by reference.

pub mod config;
pub mod error;
pub mod retry;

pub use config::{
    CollationCheckConfig, DatabaseConfig, ExpectedSchema, LockRetryConfig, PartitionEntry,
    ReferenceSpec, RepairTarget, RiskyIndex, StewardConfig,
};
pub use error::{Error, Result};
pub use retry::{RetryPolicy, RetryStep};

/// PostgreSQL's compiled-in identifier length limit (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;
