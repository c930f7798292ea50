//! Concurrent index rebuilding without downtime.
//!
//! Builds a shadow copy of an existing index with `CREATE INDEX
//! CONCURRENTLY`, validates it against the catalog, and swaps the names
//! atomically under the lock retry engine. The replacement index is dropped
//! in cleanup on every path: on failure that removes the half-built shadow,
//! on success it removes the swapped-out original.

use crate::catalog;
use crate::error::{OpsError, OpsResult};
use crate::lock_retries::WithLockRetries;
use crate::session;
use crate::sql::{derived_name, quote_ident, quote_qualified};
use sqlx::{PgConnection, PgPool};
use steward_core::RetryPolicy;

/// Suffix of the shadow index while it is being built.
pub const REPLACEMENT_SUFFIX: &str = "_ccnew";

/// Suffix parking the original index mid-swap.
pub const ARCHIVE_SUFFIX: &str = "_ccold";

/// Concurrent rebuild of one existing index.
pub struct ConcurrentReindex<'a> {
    pool: &'a PgPool,
    schema: String,
    retries: WithLockRetries,
}

impl<'a> ConcurrentReindex<'a> {
    pub fn new(pool: &'a PgPool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            schema: "public".to_string(),
            retries: WithLockRetries::new(policy).raise_on_exhaustion(true),
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// Rebuild `index_name` concurrently and swap it in.
    ///
    /// Fails fast, creating nothing, when the index does not exist or is
    /// UNIQUE (a concurrent rebuild of a unique index can deadlock against
    /// concurrent writers enforcing the constraint, so it is unsupported).
    pub async fn execute(&self, index_name: &str) -> OpsResult<()> {
        let mut conn = self.pool.acquire().await.map_err(OpsError::from)?;

        let info = catalog::index_info(&mut conn, &self.schema, index_name)
            .await?
            .ok_or_else(|| {
                OpsError::Precondition(format!(
                    "index {}.{index_name} does not exist",
                    self.schema
                ))
            })?;
        if info.is_unique {
            return Err(OpsError::Precondition(format!(
                "index {}.{index_name} is UNIQUE; concurrent rebuild of unique indexes is not supported",
                self.schema
            )));
        }

        let replacement = derived_name(index_name, REPLACEMENT_SUFFIX);
        let archive = derived_name(index_name, ARCHIVE_SUFFIX);

        // A crashed prior run can leave either derived index behind; both
        // must go before this run starts.
        self.drop_if_exists(&mut conn, &replacement).await?;
        self.drop_if_exists(&mut conn, &archive).await?;

        let result = self
            .rebuild(&mut conn, &info.definition, index_name, &replacement, &archive)
            .await;

        if let Err(cleanup_err) = self.drop_if_exists(&mut conn, &replacement).await {
            tracing::warn!(
                index = %replacement,
                error = %cleanup_err,
                "failed to drop replacement index during cleanup"
            );
        }

        result
    }

    async fn rebuild(
        &self,
        conn: &mut PgConnection,
        definition: &str,
        index_name: &str,
        replacement: &str,
        archive: &str,
    ) -> OpsResult<()> {
        let create_sql = clone_definition(definition, index_name, replacement)?;

        tracing::info!(index = index_name, replacement, "creating replacement index concurrently");
        session::disable_statement_timeout(conn).await?;
        let created = sqlx::query(&create_sql).execute(&mut *conn).await;
        let restored = session::restore_statement_timeout(conn).await;
        created.map_err(OpsError::from)?;
        restored?;

        let new_info = catalog::index_info(conn, &self.schema, replacement)
            .await?
            .ok_or_else(|| {
                OpsError::Reindex(format!(
                    "replacement index {replacement} vanished after creation"
                ))
            })?;
        if !new_info.is_valid {
            // A concurrent build that failed partway leaves an INVALID
            // index behind; it must not be swapped in.
            return Err(OpsError::Reindex(format!(
                "replacement index {replacement} is INVALID after concurrent build"
            )));
        }

        let statements = vec![
            format!(
                "ALTER INDEX {} RENAME TO {}",
                quote_qualified(&self.schema, index_name),
                quote_ident(archive)
            ),
            format!(
                "ALTER INDEX {} RENAME TO {}",
                quote_qualified(&self.schema, replacement),
                quote_ident(index_name)
            ),
            format!(
                "ALTER INDEX {} RENAME TO {}",
                quote_qualified(&self.schema, archive),
                quote_ident(replacement)
            ),
        ];

        match self.retries.run_statements(self.pool, &statements).await {
            Ok(()) => {
                tracing::info!(index = index_name, "index swap complete");
                Ok(())
            }
            Err(err) => {
                tracing::error!(index = index_name, error = %err, "index swap failed");
                Err(OpsError::Reindex(format!(
                    "failed to swap in replacement for {}.{index_name}: {err}",
                    self.schema
                )))
            }
        }
    }

    async fn drop_if_exists(&self, conn: &mut PgConnection, index: &str) -> OpsResult<()> {
        let sql = format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {}",
            quote_qualified(&self.schema, index)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
        Ok(())
    }
}

/// Derive the `CREATE INDEX CONCURRENTLY` statement for the replacement from
/// the original's `pg_get_indexdef` output. The index name is quoted in the
/// definition only when PostgreSQL had to, so both spellings are tried.
fn clone_definition(definition: &str, old: &str, new: &str) -> OpsResult<String> {
    let quoted = format!("INDEX {} ON", quote_ident(old));
    let plain = format!("INDEX {old} ON");
    let target = format!("INDEX CONCURRENTLY {} ON", quote_ident(new));

    for candidate in [&quoted, &plain] {
        if definition.contains(candidate.as_str()) {
            return Ok(definition.replacen(candidate.as_str(), &target, 1));
        }
    }

    Err(OpsError::Reindex(format!(
        "could not derive a replacement definition from: {definition}"
    )))
}
