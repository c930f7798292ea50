//! Collation corruption detection.
//!
//! An OS upgrade that changes glibc/ICU sort order silently corrupts every
//! index built under the old collation: lookups miss rows, and unique
//! indexes stop enforcing uniqueness. Two signals are checked:
//!
//! 1. Collations whose stored `collversion` differs from what the OS
//!    currently reports (`pg_collation_actual_version`).
//! 2. A duplicate-key spot-check over configured known-risky unique
//!    indexes (the observable damage version drift causes).
//!
//! The sweep degrades gracefully: a failed probe of one index is logged and
//! skipped so the rest of the report still lands.

use crate::catalog::{self, CollationVersionDrift};
use crate::error::OpsResult;
use crate::sql::{quote_ident, quote_qualified};
use serde::Serialize;
use sqlx::PgConnection;
use steward_core::RiskyIndex;

/// Cap on duplicate groups counted per index; the point is detection, not
/// enumeration.
const MAX_DUPLICATE_GROUPS: i64 = 100;

/// One unique index found to contain duplicate keys.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateKeyFinding {
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub duplicate_groups: i64,
}

/// Collation health report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollationReport {
    pub version_drift: Vec<CollationVersionDrift>,
    pub corrupted_indexes: Vec<DuplicateKeyFinding>,
    /// Operator-facing guidance derived from the findings.
    pub remediation: Vec<String>,
}

impl CollationReport {
    pub fn is_clean(&self) -> bool {
        self.version_drift.is_empty() && self.corrupted_indexes.is_empty()
    }
}

/// Collation version drift and duplicate-key spot checks.
pub struct CollationChecker<'a> {
    risky_indexes: &'a [RiskyIndex],
    schema: String,
}

impl<'a> CollationChecker<'a> {
    pub fn new(risky_indexes: &'a [RiskyIndex]) -> Self {
        Self {
            risky_indexes,
            schema: "public".to_string(),
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub async fn execute(&self, conn: &mut PgConnection) -> OpsResult<CollationReport> {
        let mut report = CollationReport::default();

        match catalog::outdated_collations(conn).await {
            Ok(drift) => report.version_drift = drift,
            Err(err) => {
                tracing::warn!(error = %err, "skipping collation version comparison; catalog read failed");
            }
        }

        for risky in self.risky_indexes {
            match self.count_duplicate_groups(conn, risky).await {
                Ok(0) => {}
                Ok(groups) => {
                    tracing::warn!(
                        table = %risky.table,
                        index = %risky.index,
                        duplicate_groups = groups,
                        "unique index contains duplicate keys"
                    );
                    report.corrupted_indexes.push(DuplicateKeyFinding {
                        table: risky.table.clone(),
                        index: risky.index.clone(),
                        columns: risky.columns.clone(),
                        duplicate_groups: groups,
                    });
                }
                Err(err) => {
                    tracing::warn!(table = %risky.table, index = %risky.index, error = %err, "skipping duplicate spot-check");
                }
            }
        }

        if !report.version_drift.is_empty() {
            report.remediation.push(
                "collation versions drifted: REINDEX affected indexes, then \
                 ALTER COLLATION ... REFRESH VERSION (or REINDEX DATABASE)"
                    .to_string(),
            );
        }
        for finding in &report.corrupted_indexes {
            report.remediation.push(format!(
                "index {} on {} holds duplicate keys; run the index repair plan before reindexing",
                finding.index, finding.table
            ));
        }

        Ok(report)
    }

    async fn count_duplicate_groups(
        &self,
        conn: &mut PgConnection,
        risky: &RiskyIndex,
    ) -> OpsResult<i64> {
        let query = duplicate_groups_query(&self.schema, &risky.table, &risky.columns);
        let count: i64 = sqlx::query_scalar(&query)
            .bind(MAX_DUPLICATE_GROUPS)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }
}

/// Count key groups (all columns non-null) occurring more than once.
fn duplicate_groups_query(schema: &str, table: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let not_null: Vec<String> = quoted.iter().map(|c| format!("{c} IS NOT NULL")).collect();
    format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1 LIMIT $1) dups",
        quote_qualified(schema, table),
        not_null.join(" AND "),
        quoted.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_query_groups_by_all_index_columns() {
        let sql = duplicate_groups_query(
            "public",
            "tags",
            &["name".to_string(), "scope".to_string()],
        );
        assert!(sql.contains("\"name\" IS NOT NULL AND \"scope\" IS NOT NULL"));
        assert!(sql.contains("GROUP BY \"name\", \"scope\""));
        assert!(sql.contains("HAVING COUNT(*) > 1"));
    }
}
