//! Partition lifecycle management: attach, detach, truncate.
//!
//! All operations are gated on an explicit allow-list of configured
//! partitions; this tooling must never be pointable at arbitrary tables.
//! Catalog state is introspected fresh per call and per database target;
//! a deployment may run several logical databases and a partition may exist
//! on one but not another.
//!
//! Detach is only performed when the partition already carries the
//! configured CHECK constraint mirroring its bounds. With the constraint in
//! place PostgreSQL skips the full validation scan on a later reattach,
//! which would otherwise run under an exclusive lock. The same check guards
//! attach, for the same reason.
//!
//! Precondition failures (wrong state, missing constraint, partition absent
//! on this database) return `Ok(false)` with a logged reason and perform no
//! DDL. Only allow-list violations are hard errors.

use crate::catalog;
use crate::error::{OpsError, OpsResult};
use crate::lock_retries::WithLockRetries;
use crate::sql::quote_qualified;
use sqlx::{PgConnection, PgPool};
use steward_core::{PartitionEntry, RetryPolicy};

/// Direction of an [`AlterPartition`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    Attach,
    Detach,
}

/// Attach or detach an allow-listed partition.
pub struct AlterPartition<'a> {
    pool: &'a PgPool,
    entries: &'a [PartitionEntry],
    retries: WithLockRetries,
}

impl<'a> AlterPartition<'a> {
    pub fn new(pool: &'a PgPool, entries: &'a [PartitionEntry], policy: RetryPolicy) -> Self {
        Self {
            pool,
            entries,
            // No silent unbounded-lock fallback for DDL of this class.
            retries: WithLockRetries::new(policy).raise_on_exhaustion(true),
        }
    }

    /// Perform the transition. Returns `Ok(true)` when DDL ran, `Ok(false)`
    /// when a precondition did not hold on this database.
    pub async fn execute(&self, partition_name: &str, mode: PartitionMode) -> OpsResult<bool> {
        let entry = allowed_entry(self.entries, partition_name)?;
        let mut conn = self.pool.acquire().await.map_err(OpsError::from)?;

        if !catalog::table_exists(&mut conn, &entry.parent_schema, &entry.partition_name).await? {
            tracing::warn!(
                partition = %entry.partition_name,
                "partition does not exist on this database, skipping"
            );
            return Ok(false);
        }

        let attached = catalog::is_partition_attached(
            &mut conn,
            &entry.parent_schema,
            &entry.partition_name,
            &entry.parent_table,
        )
        .await?;

        let statement = match mode {
            PartitionMode::Detach => {
                if !attached {
                    tracing::warn!(partition = %entry.partition_name, "already detached, skipping");
                    return Ok(false);
                }
                if !self.has_required_constraint(&mut conn, entry).await? {
                    return Ok(false);
                }
                detach_statement(entry)
            }
            PartitionMode::Attach => {
                if attached {
                    tracing::warn!(partition = %entry.partition_name, "already attached, skipping");
                    return Ok(false);
                }
                if !self.has_required_constraint(&mut conn, entry).await? {
                    return Ok(false);
                }
                attach_statement(entry)
            }
        };

        drop(conn);

        self.retries
            .run_statements(self.pool, std::slice::from_ref(&statement))
            .await?;

        tracing::info!(partition = %entry.partition_name, ?mode, "partition transition complete");
        Ok(true)
    }

    async fn has_required_constraint(
        &self,
        conn: &mut PgConnection,
        entry: &PartitionEntry,
    ) -> OpsResult<bool> {
        let constraints =
            catalog::check_constraints(conn, &entry.parent_schema, &entry.partition_name).await?;

        if constraints.iter().any(|c| c.name == entry.required_constraint) {
            return Ok(true);
        }

        tracing::warn!(
            partition = %entry.partition_name,
            constraint = %entry.required_constraint,
            "missing bounds CHECK constraint; without it the next attach takes a \
             full validation scan under an exclusive lock. Create it first: \
             ALTER TABLE ... ADD CONSTRAINT ... CHECK (...) NOT VALID, then VALIDATE CONSTRAINT"
        );
        Ok(false)
    }
}

/// Truncate a currently-detached, allow-listed partition.
pub struct TruncatePartition<'a> {
    pool: &'a PgPool,
    entries: &'a [PartitionEntry],
    retries: WithLockRetries,
}

impl<'a> TruncatePartition<'a> {
    pub fn new(pool: &'a PgPool, entries: &'a [PartitionEntry], policy: RetryPolicy) -> Self {
        Self {
            pool,
            entries,
            retries: WithLockRetries::new(policy).raise_on_exhaustion(true),
        }
    }

    /// Truncate the partition. Returns `Ok(false)` without DDL when the
    /// partition is absent here or still attached.
    pub async fn execute(&self, partition_name: &str) -> OpsResult<bool> {
        let entry = allowed_entry(self.entries, partition_name)?;
        let mut conn = self.pool.acquire().await.map_err(OpsError::from)?;

        if !catalog::table_exists(&mut conn, &entry.parent_schema, &entry.partition_name).await? {
            tracing::warn!(partition = %entry.partition_name, "partition does not exist on this database, skipping");
            return Ok(false);
        }

        let attached = catalog::is_partition_attached(
            &mut conn,
            &entry.parent_schema,
            &entry.partition_name,
            &entry.parent_table,
        )
        .await?;
        if attached {
            tracing::warn!(
                partition = %entry.partition_name,
                "cannot truncate an attached partition; detach it first"
            );
            return Ok(false);
        }

        drop(conn);

        let statement = truncate_statement(entry);
        self.retries
            .run_statements(self.pool, std::slice::from_ref(&statement))
            .await?;

        tracing::info!(partition = %entry.partition_name, "partition truncated");
        Ok(true)
    }
}

fn allowed_entry<'e>(
    entries: &'e [PartitionEntry],
    partition_name: &str,
) -> OpsResult<&'e PartitionEntry> {
    entries
        .iter()
        .find(|e| e.partition_name == partition_name)
        .ok_or_else(|| {
            OpsError::Precondition(format!(
                "partition '{partition_name}' is not in the configured allow-list"
            ))
        })
}

fn detach_statement(entry: &PartitionEntry) -> String {
    format!(
        "ALTER TABLE {} DETACH PARTITION {}",
        quote_qualified(&entry.parent_schema, &entry.parent_table),
        quote_qualified(&entry.parent_schema, &entry.partition_name),
    )
}

fn attach_statement(entry: &PartitionEntry) -> String {
    format!(
        "ALTER TABLE {} ATTACH PARTITION {} {}",
        quote_qualified(&entry.parent_schema, &entry.parent_table),
        quote_qualified(&entry.parent_schema, &entry.partition_name),
        entry.bounds_clause,
    )
}

fn truncate_statement(entry: &PartitionEntry) -> String {
    format!(
        "TRUNCATE TABLE {}",
        quote_qualified(&entry.parent_schema, &entry.partition_name)
    )
}
