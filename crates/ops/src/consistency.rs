//! Rolling consistency audit between two related tables.
//!
//! Compares a source and a target relation over a shared ordered key in
//! fixed-size batches, bounded by a batch-count cap and a wall-clock budget
//! so a single invocation never blocks a scheduler slot for long. The
//! returned cursor wraps to the table minimum once the maximum is passed,
//! turning repeated invocations into a perpetual background audit.

use crate::error::OpsResult;
use crate::sql::{quote_ident, quote_qualified};
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub const DEFAULT_BATCH_SIZE: i64 = 1_000;
pub const DEFAULT_MAX_BATCHES: usize = 25;
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(300);

/// Cap on accumulated mismatch details; the run stops early at the cap so
/// the report invariant `mismatches == mismatches_details.len()` holds.
pub const MAX_MISMATCH_DETAILS: usize = 100;

/// One mismatched key. Exactly one of the sides may be absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub id: i64,
    pub source_values: Option<Vec<Option<String>>>,
    pub target_values: Option<Vec<Option<String>>>,
}

/// Result of one checker invocation. Only `next_start_id` needs persisting
/// between runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    pub matches: u64,
    pub mismatches: u64,
    pub batches: u64,
    pub mismatches_details: Vec<Mismatch>,
    pub next_start_id: Option<i64>,
}

/// Batched source/target table comparator.
#[derive(Debug, Clone)]
pub struct ConsistencyChecker {
    source_table: String,
    target_table: String,
    key_column: String,
    columns: Vec<String>,
    batch_size: i64,
    max_batches: usize,
    max_runtime: Duration,
}

impl ConsistencyChecker {
    /// Compare `columns` of two tables keyed and ordered by `key_column`.
    pub fn new(
        schema: &str,
        source_table: &str,
        target_table: &str,
        key_column: &str,
        columns: Vec<String>,
    ) -> Self {
        Self {
            source_table: quote_qualified(schema, source_table),
            target_table: quote_qualified(schema, target_table),
            key_column: key_column.to_string(),
            columns,
            batch_size: DEFAULT_BATCH_SIZE,
            max_batches: DEFAULT_MAX_BATCHES,
            max_runtime: DEFAULT_MAX_RUNTIME,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    fn batch_query(&self, table: &str, with_limit: bool) -> String {
        let key = quote_ident(&self.key_column);
        let casts: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("({})::TEXT", quote_ident(c)))
            .collect();
        let limit = if with_limit { " LIMIT $3" } else { "" };
        format!(
            "SELECT {key}, ARRAY[{}] FROM {table} WHERE {key} >= $1 AND {key} < $2 ORDER BY {key}{limit}",
            casts.join(", "),
        )
    }

    /// Run one bounded audit slice starting at `start_id` (or the source
    /// minimum). Returns the report with the cursor to resume from.
    pub async fn execute(
        &self,
        conn: &mut PgConnection,
        start_id: Option<i64>,
    ) -> OpsResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        let key = quote_ident(&self.key_column);
        let bounds_query = format!(
            "SELECT MIN({key}), MAX({key}) FROM {}",
            self.source_table
        );
        let (min_id, max_id): (Option<i64>, Option<i64>) =
            sqlx::query_as(&bounds_query).fetch_one(&mut *conn).await?;

        let (Some(min_id), Some(max_id)) = (min_id, max_id) else {
            // Empty source: nothing to audit, no cursor to carry.
            return Ok(report);
        };

        // A cursor past the maximum restarts the ring scan at the minimum.
        let mut cursor = start_id.unwrap_or(min_id);
        if cursor > max_id {
            cursor = min_id;
        }

        // The source batch is LIMIT-bounded; the target is bounded by the key
        // range the source batch fixed, so target-only rows are never cut off.
        let source_query = self.batch_query(&self.source_table, true);
        let target_query = self.batch_query(&self.target_table, false);
        let started = Instant::now();

        while (report.batches as usize) < self.max_batches && cursor <= max_id {
            if started.elapsed() >= self.max_runtime {
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "consistency check hit its time budget");
                break;
            }

            // The source drives the batch; its last key fixes the range both
            // sides are compared over.
            let source_rows: Vec<(i64, Vec<Option<String>>)> = sqlx::query_as(&source_query)
                .bind(cursor)
                .bind(max_id + 1)
                .bind(self.batch_size)
                .fetch_all(&mut *conn)
                .await?;

            let Some(&(last_id, _)) = source_rows.last() else {
                cursor = max_id + 1;
                break;
            };
            let range_end = last_id + 1;

            let target_rows: Vec<(i64, Vec<Option<String>>)> = sqlx::query_as(&target_query)
                .bind(cursor)
                .bind(range_end)
                .fetch_all(&mut *conn)
                .await?;

            let (matches, mismatches) = diff_rows(source_rows, target_rows);
            report.matches += matches;
            report.batches += 1;
            cursor = range_end;

            for mismatch in mismatches {
                report.mismatches += 1;
                report.mismatches_details.push(mismatch);
                if report.mismatches_details.len() >= MAX_MISMATCH_DETAILS {
                    tracing::warn!(details = MAX_MISMATCH_DETAILS, "mismatch detail cap reached, stopping run early");
                    report.next_start_id = Some(if cursor > max_id { min_id } else { cursor });
                    return Ok(report);
                }
            }
        }

        report.next_start_id = Some(if cursor > max_id { min_id } else { cursor });
        Ok(report)
    }
}

/// Diff two ordered row sets keyed by id. Each differing key is attributed
/// exactly once, whichever side(s) it appears on.
fn diff_rows(
    source_rows: Vec<(i64, Vec<Option<String>>)>,
    target_rows: Vec<(i64, Vec<Option<String>>)>,
) -> (u64, Vec<Mismatch>) {
    let source: BTreeMap<i64, Vec<Option<String>>> = source_rows.into_iter().collect();
    let mut target: BTreeMap<i64, Vec<Option<String>>> = target_rows.into_iter().collect();

    let mut matches = 0_u64;
    let mut mismatches = Vec::new();

    for (id, source_values) in source {
        match target.remove(&id) {
            Some(target_values) if target_values == source_values => matches += 1,
            Some(target_values) => mismatches.push(Mismatch {
                id,
                source_values: Some(source_values),
                target_values: Some(target_values),
            }),
            None => mismatches.push(Mismatch {
                id,
                source_values: Some(source_values),
                target_values: None,
            }),
        }
    }

    // Whatever remains exists only on the target side.
    for (id, target_values) in target {
        mismatches.push(Mismatch {
            id,
            source_values: None,
            target_values: Some(target_values),
        });
    }

    mismatches.sort_by_key(|m| m.id);
    (matches, mismatches)
}
