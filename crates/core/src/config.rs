//! Configuration types shared across crates.

use crate::error::Error;
use crate::retry::{RetryPolicy, RetryStep};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level Steward configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StewardConfig {
    /// Named database targets. A deployment may have several logical
    /// databases (e.g. `main` and `ci`); every operation names the target it
    /// runs against.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,

    /// Lock retry engine settings.
    #[serde(default)]
    pub lock_retries: LockRetryConfig,

    /// Partition allow-list. Attach/detach/truncate refuse to operate on
    /// partitions not listed here.
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,

    /// Index repair plan.
    #[serde(default)]
    pub repair: Vec<RepairTarget>,

    /// Expected schema for drift detection.
    #[serde(default)]
    pub expected_schema: ExpectedSchema,

    /// Collation checker inputs.
    #[serde(default)]
    pub collation_check: CollationCheckConfig,
}

impl StewardConfig {
    /// Validate cross-cutting invariants. Returns the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, db) in &self.databases {
            db.validate()
                .map_err(|e| Error::Config(format!("database '{name}': {e}")))?;
        }
        self.lock_retries.validate()?;
        for entry in &self.partitions {
            entry.validate()?;
        }
        for target in &self.repair {
            target.validate()?;
        }
        Ok(())
    }

    /// Look up a database target by name.
    pub fn database(&self, name: &str) -> Result<&DatabaseConfig, Error> {
        self.databases
            .get(name)
            .ok_or_else(|| Error::UnknownDatabase(name.to_string()))
    }

    /// Look up a partition allow-list entry by partition name.
    pub fn partition_entry(&self, partition_name: &str) -> Result<&PartitionEntry, Error> {
        self.partitions
            .iter()
            .find(|p| p.partition_name == partition_name)
            .ok_or_else(|| Error::PartitionNotAllowed(partition_name.to_string()))
    }
}

/// Connection settings for one logical database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (optional if using individual fields).
    /// Takes precedence over individual fields if both are provided.
    pub url: Option<String>,
    /// Database host (e.g., "localhost" or "db.example.com").
    pub host: Option<String>,
    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: Option<u16>,
    /// Database username.
    pub username: Option<String>,
    /// Database password.
    /// WARNING: Prefer the STEWARD_DATABASES__<NAME>__PASSWORD env var over
    /// storing this in a config file.
    pub password: Option<String>,
    /// Database name.
    pub database: Option<String>,
    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Statement timeout in milliseconds applied to pooled sessions.
    /// Individual operations (concurrent index builds) lift it explicitly.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: Option<u64>,
}

fn default_max_connections() -> u32 {
    5
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000) // 5 minutes
}

impl DatabaseConfig {
    /// Validate connection configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match (self.url.as_ref(), self.host.as_ref(), self.database.as_ref()) {
            (Some(_), _, _) => Ok(()),
            (None, Some(_), Some(_)) => Ok(()),
            _ => Err("requires either 'url' or 'host' + 'database'".to_string()),
        }
    }
}

/// Lock retry engine settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LockRetryConfig {
    /// Override schedule as `[lock_timeout_ms, sleep_ms]` pairs. When unset
    /// the standard escalation curve applies.
    pub timings_ms: Option<Vec<[u64; 2]>>,
    /// Operational escape hatch: run a single unguarded attempt instead of
    /// the retry loop. For local/dev use only.
    #[serde(default)]
    pub disabled: bool,
}

impl LockRetryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(timings) = &self.timings_ms
            && timings.is_empty()
        {
            return Err(Error::Config(
                "lock_retries.timings_ms must not be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the runtime policy from this configuration.
    pub fn policy(&self) -> RetryPolicy {
        let policy = match &self.timings_ms {
            Some(timings) => RetryPolicy::new(
                timings
                    .iter()
                    .map(|&[t, s]| RetryStep::from_millis(t, s))
                    .collect(),
            ),
            None => RetryPolicy::standard(),
        };
        policy.disabled(self.disabled)
    }
}

/// One allow-listed partition.
///
/// Detach is only safe when the partition already carries a CHECK constraint
/// equivalent to its partition bounds; otherwise a future reattach would
/// take an exclusive lock for a full validation scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionEntry {
    /// Partition (child table) name.
    pub partition_name: String,
    /// Parent (partitioned) table name.
    pub parent_table: String,
    /// Schema holding both tables (default: "public").
    #[serde(default = "default_schema")]
    pub parent_schema: String,
    /// Partition bounds clause, e.g. `FOR VALUES FROM (100) TO (200)`.
    pub bounds_clause: String,
    /// Name of the CHECK constraint that must mirror the bounds.
    pub required_constraint: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl PartitionEntry {
    pub fn validate(&self) -> Result<(), Error> {
        for (field, value) in [
            ("partition_name", &self.partition_name),
            ("parent_table", &self.parent_table),
            ("bounds_clause", &self.bounds_clause),
            ("required_constraint", &self.required_constraint),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!(
                    "partition entry '{}': {field} must not be empty",
                    self.partition_name
                )));
            }
        }
        Ok(())
    }
}

/// A known-corruptible unique index and how to repair it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepairTarget {
    /// Table owning the index.
    pub table: String,
    /// Index name.
    pub index: String,
    /// Indexed columns, in index order.
    pub columns: Vec<String>,
    /// Whether the index is UNIQUE. Only unique indexes get deduplicated;
    /// non-unique entries are only recreated when missing or invalid.
    #[serde(default)]
    pub unique: bool,
    /// Foreign-key-like references that must be remapped before duplicate
    /// rows can be deleted.
    #[serde(default)]
    pub references: Vec<ReferenceSpec>,
}

impl RepairTarget {
    pub fn validate(&self) -> Result<(), Error> {
        if self.columns.is_empty() {
            return Err(Error::Config(format!(
                "repair target '{}': columns must not be empty",
                self.index
            )));
        }
        Ok(())
    }
}

/// A reference to a repairable table's id column.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReferenceSpec {
    /// Plain scalar foreign-key column.
    Scalar { table: String, column: String },
    /// PostgreSQL array column; remapped element-wise.
    Array { table: String, column: String },
    /// Reference scoped by an owning entity. When both the surviving and the
    /// duplicate id are already referenced by the same entity, the duplicate
    /// reference row is deleted instead of creating a colliding pair.
    EntityScoped {
        table: String,
        column: String,
        entity_column: String,
    },
}

/// Expected schema for drift detection: table name to ordered column list,
/// plus the set of expected index names.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExpectedSchema {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub indexes: Vec<String>,
}

/// Inputs for the collation checker's duplicate spot-check.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollationCheckConfig {
    /// Unique indexes over collated text columns known to be at risk after
    /// OS collation library upgrades.
    #[serde(default)]
    pub risky_indexes: Vec<RiskyIndex>,
}

/// One unique index to spot-check for duplicate keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskyIndex {
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
}
