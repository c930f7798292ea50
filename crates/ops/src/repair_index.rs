//! Duplicate-key corruption repair for unique indexes.
//!
//! Consumes a static repair plan (table → index → columns + references) and,
//! for unique indexes found to contain duplicate keys:
//!
//! 1. finds duplicate row sets grouped by the index columns (all non-null),
//! 2. picks the lowest id of each group as canonical,
//! 3. rewrites every configured reference from the losing ids to the
//!    canonical one: scalar FK columns, array columns (element-wise), and
//!    entity-scoped references where a conflicting pair is deleted rather
//!    than duplicated,
//! 4. deletes the now-unreferenced duplicate rows,
//! 5. rebuilds or recreates the index concurrently.
//!
//! `dry_run` performs every read-only step and logs the SQL it would
//! execute without mutating anything.
//!
//! Tables in the plan are keyed by a bigint `id` primary key.

use crate::catalog;
use crate::error::{OpsError, OpsResult};
use crate::session;
use crate::sql::{quote_ident, quote_qualified};
use serde::Serialize;
use sqlx::{Connection, PgConnection, PgPool};
use steward_core::{ReferenceSpec, RepairTarget};

/// Repair run summary. In dry-run mode the counters reflect planned work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub targets_scanned: u64,
    pub duplicate_groups: u64,
    pub rows_removed: u64,
    pub references_updated: u64,
    pub conflicting_references_removed: u64,
    pub indexes_rebuilt: u64,
    pub dry_run: bool,
}

/// Plan-driven repair of duplicate-key corruption.
pub struct RepairIndex<'a> {
    pool: &'a PgPool,
    plan: &'a [RepairTarget],
    schema: String,
    dry_run: bool,
}

impl<'a> RepairIndex<'a> {
    pub fn new(pool: &'a PgPool, plan: &'a [RepairTarget]) -> Self {
        Self {
            pool,
            plan,
            schema: "public".to_string(),
            dry_run: false,
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn execute(&self) -> OpsResult<RepairReport> {
        let mut report = RepairReport {
            dry_run: self.dry_run,
            ..Default::default()
        };
        let mut conn = self.pool.acquire().await.map_err(OpsError::from)?;

        for target in self.plan {
            report.targets_scanned += 1;

            if !target.unique {
                // Nothing to deduplicate; just make sure the index is usable.
                self.ensure_index(&mut conn, target, &mut report).await?;
                continue;
            }

            let groups = self.duplicate_groups(&mut conn, target).await?;
            if groups.is_empty() {
                tracing::info!(table = %target.table, index = %target.index, "no duplicate keys found");
                self.ensure_index(&mut conn, target, &mut report).await?;
                continue;
            }

            tracing::warn!(
                table = %target.table,
                index = %target.index,
                groups = groups.len(),
                "found duplicate key groups"
            );

            for ids in &groups {
                report.duplicate_groups += 1;
                self.repair_group(&mut conn, target, ids, &mut report).await?;
            }

            self.rebuild_index(&mut conn, target, &mut report).await?;
        }

        Ok(report)
    }

    /// Duplicate row-id sets, each ordered ascending so the first id is the
    /// surviving canonical row.
    async fn duplicate_groups(
        &self,
        conn: &mut PgConnection,
        target: &RepairTarget,
    ) -> OpsResult<Vec<Vec<i64>>> {
        let query = duplicate_groups_query(&self.schema, target);
        let rows: Vec<(Vec<i64>,)> = sqlx::query_as(&query).fetch_all(&mut *conn).await?;
        Ok(rows.into_iter().map(|(ids,)| ids).collect())
    }

    /// Remap references away from the losing ids of one group, then delete
    /// the losers. All statements for the group run in one transaction.
    async fn repair_group(
        &self,
        conn: &mut PgConnection,
        target: &RepairTarget,
        ids: &[i64],
        report: &mut RepairReport,
    ) -> OpsResult<()> {
        let (&good_id, bad_ids) = ids
            .split_first()
            .ok_or_else(|| OpsError::Precondition("empty duplicate group".to_string()))?;
        if bad_ids.is_empty() {
            return Ok(());
        }

        let mut conflict_deletes = Vec::new();
        let mut updates = Vec::new();
        for bad_id in bad_ids {
            for reference in &target.references {
                let (conflict, update) =
                    reference_statements(&self.schema, reference, good_id, *bad_id);
                if let Some(conflict) = conflict {
                    conflict_deletes.push(conflict);
                }
                updates.push(update);
            }
        }
        let delete_rows = delete_rows_statement(&self.schema, &target.table, bad_ids);

        if self.dry_run {
            for sql in conflict_deletes.iter().chain(&updates) {
                tracing::info!(sql = %sql, "dry run: would execute");
            }
            tracing::info!(sql = %delete_rows, "dry run: would execute");
            report.conflicting_references_removed += conflict_deletes.len() as u64;
            report.references_updated += updates.len() as u64;
            report.rows_removed += bad_ids.len() as u64;
            return Ok(());
        }

        let mut tx = conn.begin().await.map_err(OpsError::from)?;
        for sql in &conflict_deletes {
            let removed = sqlx::query(sql).execute(&mut *tx).await?.rows_affected();
            if removed > 0 {
                // This drops reference rows outright; loud enough to audit.
                tracing::warn!(sql = %sql, removed, "deleted conflicting entity-scoped references");
            }
            report.conflicting_references_removed += removed;
        }
        for sql in &updates {
            report.references_updated += sqlx::query(sql).execute(&mut *tx).await?.rows_affected();
        }
        report.rows_removed += sqlx::query(&delete_rows)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await.map_err(OpsError::from)?;

        tracing::info!(
            table = %target.table,
            good_id,
            removed = bad_ids.len(),
            "duplicate group collapsed onto canonical row"
        );
        Ok(())
    }

    /// Recreate a missing or invalid index; leave a valid one alone.
    async fn ensure_index(
        &self,
        conn: &mut PgConnection,
        target: &RepairTarget,
        report: &mut RepairReport,
    ) -> OpsResult<()> {
        match catalog::index_info(conn, &self.schema, &target.index).await? {
            Some(info) if info.is_valid => Ok(()),
            Some(_) => {
                tracing::warn!(index = %target.index, "index is INVALID, recreating");
                self.recreate_index(conn, target, report).await
            }
            None => {
                tracing::warn!(index = %target.index, "index is missing, creating");
                self.recreate_index(conn, target, report).await
            }
        }
    }

    /// Rebuild after deduplication: a still-valid index is reindexed in
    /// place, anything else is dropped and recreated.
    async fn rebuild_index(
        &self,
        conn: &mut PgConnection,
        target: &RepairTarget,
        report: &mut RepairReport,
    ) -> OpsResult<()> {
        match catalog::index_info(conn, &self.schema, &target.index).await? {
            Some(info) if info.is_valid => {
                let sql = format!(
                    "REINDEX INDEX CONCURRENTLY {}",
                    quote_qualified(&self.schema, &target.index)
                );
                self.run_index_build(conn, &sql, report).await
            }
            _ => self.recreate_index(conn, target, report).await,
        }
    }

    async fn recreate_index(
        &self,
        conn: &mut PgConnection,
        target: &RepairTarget,
        report: &mut RepairReport,
    ) -> OpsResult<()> {
        let drop = format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {}",
            quote_qualified(&self.schema, &target.index)
        );
        let create = create_index_statement(&self.schema, target);

        if self.dry_run {
            tracing::info!(sql = %drop, "dry run: would execute");
            tracing::info!(sql = %create, "dry run: would execute");
            report.indexes_rebuilt += 1;
            return Ok(());
        }

        sqlx::query(&drop).execute(&mut *conn).await?;
        self.run_index_build(conn, &create, report).await
    }

    async fn run_index_build(
        &self,
        conn: &mut PgConnection,
        sql: &str,
        report: &mut RepairReport,
    ) -> OpsResult<()> {
        if self.dry_run {
            tracing::info!(sql = %sql, "dry run: would execute");
            report.indexes_rebuilt += 1;
            return Ok(());
        }

        session::disable_statement_timeout(conn).await?;
        let built = sqlx::query(sql).execute(&mut *conn).await;
        let restored = session::restore_statement_timeout(conn).await;
        built.map_err(OpsError::from)?;
        restored?;
        report.indexes_rebuilt += 1;
        Ok(())
    }
}

/// Group rows by the index columns (all non-null) and collect each group's
/// ids in ascending order; only groups with more than one row come back.
fn duplicate_groups_query(schema: &str, target: &RepairTarget) -> String {
    let columns: Vec<String> = target.columns.iter().map(|c| quote_ident(c)).collect();
    let not_null: Vec<String> = columns.iter().map(|c| format!("{c} IS NOT NULL")).collect();
    format!(
        "SELECT ARRAY_AGG(id ORDER BY id) FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1",
        quote_qualified(schema, &target.table),
        not_null.join(" AND "),
        columns.join(", "),
    )
}

/// Statements remapping one reference from `bad_id` to `good_id`. The first
/// element, when present, removes entity-scoped rows that would collide
/// after the remap; the second performs the remap itself.
fn reference_statements(
    schema: &str,
    reference: &ReferenceSpec,
    good_id: i64,
    bad_id: i64,
) -> (Option<String>, String) {
    match reference {
        ReferenceSpec::Scalar { table, column } => {
            let table = quote_qualified(schema, table);
            let column = quote_ident(column);
            (
                None,
                format!("UPDATE {table} SET {column} = {good_id} WHERE {column} = {bad_id}"),
            )
        }
        ReferenceSpec::Array { table, column } => {
            let table = quote_qualified(schema, table);
            let column = quote_ident(column);
            (
                None,
                format!(
                    "UPDATE {table} SET {column} = ARRAY_REPLACE({column}, {bad_id}, {good_id}) \
                     WHERE {column} @> ARRAY[{bad_id}]::BIGINT[]"
                ),
            )
        }
        ReferenceSpec::EntityScoped {
            table,
            column,
            entity_column,
        } => {
            let table = quote_qualified(schema, table);
            let column = quote_ident(column);
            let entity = quote_ident(entity_column);
            (
                Some(format!(
                    "DELETE FROM {table} WHERE {column} = {bad_id} AND {entity} IN \
                     (SELECT {entity} FROM {table} WHERE {column} = {good_id})"
                )),
                format!("UPDATE {table} SET {column} = {good_id} WHERE {column} = {bad_id}"),
            )
        }
    }
}

fn delete_rows_statement(schema: &str, table: &str, bad_ids: &[i64]) -> String {
    let ids: Vec<String> = bad_ids.iter().map(|id| id.to_string()).collect();
    format!(
        "DELETE FROM {} WHERE id IN ({})",
        quote_qualified(schema, table),
        ids.join(", "),
    )
}

fn create_index_statement(schema: &str, target: &RepairTarget) -> String {
    let columns: Vec<String> = target.columns.iter().map(|c| quote_ident(c)).collect();
    let unique = if target.unique { "UNIQUE " } else { "" };
    format!(
        "CREATE {unique}INDEX CONCURRENTLY {} ON {} ({})",
        quote_ident(&target.index),
        quote_qualified(schema, &target.table),
        columns.join(", "),
    )
}
