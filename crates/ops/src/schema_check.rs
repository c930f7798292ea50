//! Schema drift detection.
//!
//! Compares an expected schema (tables with their columns, plus expected
//! index names) against the live database and reports the differences. Runs
//! as a broad health sweep: a failed read on one object class is logged and
//! skipped so the rest of the report still lands.

use crate::error::OpsResult;
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::{BTreeMap, BTreeSet};
use steward_core::ExpectedSchema;

/// Structured drift report. Empty vectors mean no drift of that class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaReport {
    pub missing_tables: Vec<String>,
    pub extra_tables: Vec<String>,
    /// `table.column` entries expected but absent.
    pub missing_columns: Vec<String>,
    /// `table.column` entries present but not expected.
    pub extra_columns: Vec<String>,
    pub missing_indexes: Vec<String>,
    pub extra_indexes: Vec<String>,
}

impl SchemaReport {
    pub fn is_clean(&self) -> bool {
        self.missing_tables.is_empty()
            && self.extra_tables.is_empty()
            && self.missing_columns.is_empty()
            && self.extra_columns.is_empty()
            && self.missing_indexes.is_empty()
            && self.extra_indexes.is_empty()
    }
}

/// Expected-vs-live schema comparison for one schema namespace.
pub struct SchemaChecker<'a> {
    expected: &'a ExpectedSchema,
    schema: String,
}

impl<'a> SchemaChecker<'a> {
    pub fn new(expected: &'a ExpectedSchema) -> Self {
        Self {
            expected,
            schema: "public".to_string(),
        }
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub async fn execute(&self, conn: &mut PgConnection) -> OpsResult<SchemaReport> {
        let mut report = SchemaReport::default();

        match self.live_columns(conn).await {
            Ok(live) => diff_tables(self.expected, &live, &mut report),
            Err(err) => {
                tracing::warn!(error = %err, "skipping table/column comparison; information_schema read failed");
            }
        }

        match self.live_indexes(conn).await {
            Ok(live) => diff_indexes(self.expected, &live, &mut report),
            Err(err) => {
                tracing::warn!(error = %err, "skipping index comparison; pg_indexes read failed");
            }
        }

        Ok(report)
    }

    async fn live_columns(
        &self,
        conn: &mut PgConnection,
    ) -> OpsResult<BTreeMap<String, BTreeSet<String>>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT table_name, column_name
            FROM information_schema.columns
            WHERE table_schema = $1
            ORDER BY table_name, ordinal_position
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&mut *conn)
        .await?;

        let mut live: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (table, column) in rows {
            live.entry(table).or_default().insert(column);
        }
        Ok(live)
    }

    async fn live_indexes(&self, conn: &mut PgConnection) -> OpsResult<BTreeSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT indexname FROM pg_indexes WHERE schemaname = $1")
                .bind(&self.schema)
                .fetch_all(&mut *conn)
                .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

fn diff_tables(
    expected: &ExpectedSchema,
    live: &BTreeMap<String, BTreeSet<String>>,
    report: &mut SchemaReport,
) {
    for (table, expected_columns) in &expected.tables {
        match live.get(table) {
            None => report.missing_tables.push(table.clone()),
            Some(live_columns) => {
                for column in expected_columns {
                    if !live_columns.contains(column) {
                        report.missing_columns.push(format!("{table}.{column}"));
                    }
                }
                for column in live_columns {
                    if !expected_columns.contains(column) {
                        report.extra_columns.push(format!("{table}.{column}"));
                    }
                }
            }
        }
    }

    for table in live.keys() {
        if !expected.tables.contains_key(table) {
            report.extra_tables.push(table.clone());
        }
    }
}

fn diff_indexes(expected: &ExpectedSchema, live: &BTreeSet<String>, report: &mut SchemaReport) {
    let expected_set: BTreeSet<&String> = expected.indexes.iter().collect();
    for index in &expected.indexes {
        if !live.contains(index) {
            report.missing_indexes.push(index.clone());
        }
    }
    for index in live {
        if !expected_set.contains(index) {
            report.extra_indexes.push(index.clone());
        }
    }
}
