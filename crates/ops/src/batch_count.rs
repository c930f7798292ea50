//! Batched counting over arbitrarily large tables.
//!
//! Iterates contiguous key ranges of `batch_size` from the observed minimum
//! to the observed maximum (exclusive upper bound), accumulating a running
//! result, with a short sleep between batches to bound database load. On a
//! query cancellation the batch size halves and the same range retries;
//! below the floor the run gives up and returns the [`FALLBACK`] sentinel
//! instead of hanging.
//!
//! The key column must be strictly-ordered and numeric. Ranges are processed
//! in increasing order, so interleaving with concurrent inserts is safe for
//! append-only keys; deletes of already-counted rows surface as estimation
//! error, not corruption.

use crate::error::{OpsError, OpsResult};
use crate::session::ensure_not_in_transaction;
use crate::sql::{quote_ident, quote_qualified};
use sqlx::PgConnection;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: i64 = 100_000;
pub const DEFAULT_DISTINCT_BATCH_SIZE: i64 = 10_000;
pub const DEFAULT_SUM_BATCH_SIZE: i64 = 10_000;

/// Halving floor: once shrink-on-timeout would go below this, the run aborts.
pub const MIN_BATCH_SIZE: i64 = 128;

/// Upper bound on loop iterations, checked both upfront (from the key range)
/// and during the run.
pub const MAX_ALLOWED_LOOPS: i64 = 10_000;

/// Pause between batches.
pub const SLEEP_BETWEEN_BATCHES: Duration = Duration::from_millis(10);

/// Sentinel returned when counting cannot complete within its guard rails.
pub const FALLBACK: i64 = -1;

/// Sentinel for [`BatchAverageCounter`] (empty relation or aborted run).
pub const FALLBACK_AVG: f64 = -1.0;

enum BatchOp {
    Count,
    DistinctCount,
    Sum(String),
}

impl BatchOp {
    fn query(&self, table: &str, key_column: &str) -> String {
        let key = quote_ident(key_column);
        let select = match self {
            Self::Count => "COUNT(*)".to_string(),
            Self::DistinctCount => format!("COUNT(DISTINCT {key})"),
            Self::Sum(column) => format!("COALESCE(SUM({}), 0)::BIGINT", quote_ident(column)),
        };
        format!("SELECT {select} FROM {table} WHERE {key} >= $1 AND {key} < $2")
    }
}

/// Exact batched count / distinct count / sum.
#[derive(Debug, Clone)]
pub struct BatchCounter {
    table: String,
    key_column: String,
    batch_size: Option<i64>,
    start: Option<i64>,
    finish: Option<i64>,
}

impl BatchCounter {
    /// Range over `key_column` of `schema.table`.
    pub fn new(schema: &str, table: &str, key_column: &str) -> Self {
        Self {
            table: quote_qualified(schema, table),
            key_column: key_column.to_string(),
            batch_size: None,
            start: None,
            finish: None,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Explicit bounds override for callers that already know them.
    /// `finish` is exclusive.
    pub fn bounds(mut self, start: i64, finish: i64) -> Self {
        self.start = Some(start);
        self.finish = Some(finish);
        self
    }

    /// Exact row count. Returns [`FALLBACK`] when guard rails trip.
    pub async fn count(&self, conn: &mut PgConnection) -> OpsResult<i64> {
        self.execute(conn, BatchOp::Count, DEFAULT_BATCH_SIZE).await
    }

    /// Exact distinct count of the key column itself. Batching over the
    /// counted column is what makes per-batch results additive.
    pub async fn count_distinct(&self, conn: &mut PgConnection) -> OpsResult<i64> {
        self.execute(conn, BatchOp::DistinctCount, DEFAULT_DISTINCT_BATCH_SIZE)
            .await
    }

    /// Exact sum of `column`, ranging over the key column.
    pub async fn sum(&self, conn: &mut PgConnection, column: &str) -> OpsResult<i64> {
        self.execute(conn, BatchOp::Sum(column.to_string()), DEFAULT_SUM_BATCH_SIZE)
            .await
    }

    async fn execute(
        &self,
        conn: &mut PgConnection,
        op: BatchOp,
        default_batch_size: i64,
    ) -> OpsResult<i64> {
        ensure_not_in_transaction(conn).await?;

        let Some((start, finish)) = resolve_bounds(
            conn,
            &self.table,
            &self.key_column,
            self.start,
            self.finish,
        )
        .await?
        else {
            return Ok(0);
        };

        let mut batch_size = self.batch_size.unwrap_or(default_batch_size);
        if unwanted_configuration(start, finish, batch_size) {
            tracing::warn!(
                table = %self.table,
                start,
                finish,
                batch_size,
                "rejecting batch count configuration"
            );
            return Ok(FALLBACK);
        }

        let query = op.query(&self.table, &self.key_column);
        let mut total: i64 = 0;
        let mut batch_start = start;
        let mut loops: i64 = 0;

        while batch_start < finish {
            loops += 1;
            if loops > MAX_ALLOWED_LOOPS {
                tracing::warn!(table = %self.table, loops, "loop guard exceeded, aborting count");
                return Ok(FALLBACK);
            }

            let batch_end = batch_start.saturating_add(batch_size).min(finish);
            match sqlx::query_scalar::<_, i64>(&query)
                .bind(batch_start)
                .bind(batch_end)
                .fetch_one(&mut *conn)
                .await
            {
                Ok(value) => {
                    total += value;
                    batch_start = batch_end;
                }
                Err(err) => {
                    let err = OpsError::from(err);
                    if !err.is_query_canceled() {
                        return Err(err);
                    }
                    batch_size /= 2;
                    if batch_size < MIN_BATCH_SIZE {
                        tracing::warn!(
                            table = %self.table,
                            batch_size,
                            "batch size shrank below floor, aborting count"
                        );
                        return Ok(FALLBACK);
                    }
                    tracing::warn!(
                        table = %self.table,
                        batch_start,
                        batch_size,
                        "query canceled, retrying range with halved batch size"
                    );
                    continue;
                }
            }

            tokio::time::sleep(SLEEP_BETWEEN_BATCHES).await;
        }

        Ok(total)
    }
}

/// Batched average of a column.
#[derive(Debug, Clone)]
pub struct BatchAverageCounter {
    table: String,
    key_column: String,
    batch_size: Option<i64>,
}

impl BatchAverageCounter {
    pub fn new(schema: &str, table: &str, key_column: &str) -> Self {
        Self {
            table: quote_qualified(schema, table),
            key_column: key_column.to_string(),
            batch_size: None,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Average of `column` across the whole table. An empty relation (or a
    /// tripped guard rail) returns [`FALLBACK_AVG`], never NaN.
    pub async fn average(&self, conn: &mut PgConnection, column: &str) -> OpsResult<f64> {
        ensure_not_in_transaction(conn).await?;

        let Some((start, finish)) =
            resolve_bounds(conn, &self.table, &self.key_column, None, None).await?
        else {
            return Ok(FALLBACK_AVG);
        };

        let mut batch_size = self.batch_size.unwrap_or(DEFAULT_SUM_BATCH_SIZE);
        if unwanted_configuration(start, finish, batch_size) {
            tracing::warn!(table = %self.table, start, finish, batch_size, "rejecting batch average configuration");
            return Ok(FALLBACK_AVG);
        }

        let key = quote_ident(&self.key_column);
        let value = quote_ident(column);
        let query = format!(
            "SELECT COALESCE(SUM({value}), 0)::FLOAT8, COUNT({value}) FROM {} WHERE {key} >= $1 AND {key} < $2",
            self.table
        );

        let mut total_sum = 0.0_f64;
        let mut total_count: i64 = 0;
        let mut batch_start = start;
        let mut loops: i64 = 0;

        while batch_start < finish {
            loops += 1;
            if loops > MAX_ALLOWED_LOOPS {
                tracing::warn!(table = %self.table, loops, "loop guard exceeded, aborting average");
                return Ok(FALLBACK_AVG);
            }

            let batch_end = batch_start.saturating_add(batch_size).min(finish);
            match sqlx::query_as::<_, (f64, i64)>(&query)
                .bind(batch_start)
                .bind(batch_end)
                .fetch_one(&mut *conn)
                .await
            {
                Ok((sum, count)) => {
                    total_sum += sum;
                    total_count += count;
                    batch_start = batch_end;
                }
                Err(err) => {
                    let err = OpsError::from(err);
                    if !err.is_query_canceled() {
                        return Err(err);
                    }
                    batch_size /= 2;
                    if batch_size < MIN_BATCH_SIZE {
                        tracing::warn!(table = %self.table, batch_size, "batch size shrank below floor, aborting average");
                        return Ok(FALLBACK_AVG);
                    }
                    continue;
                }
            }

            tokio::time::sleep(SLEEP_BETWEEN_BATCHES).await;
        }

        if total_count == 0 {
            return Ok(FALLBACK_AVG);
        }
        Ok(total_sum / total_count as f64)
    }
}

/// Resolve the iteration bounds: explicit overrides win, otherwise the
/// observed `MIN`/`MAX` of the key column (`finish` = max + 1). `None` means
/// the relation is empty.
async fn resolve_bounds(
    conn: &mut PgConnection,
    table: &str,
    key_column: &str,
    start: Option<i64>,
    finish: Option<i64>,
) -> OpsResult<Option<(i64, i64)>> {
    if let (Some(start), Some(finish)) = (start, finish) {
        return Ok(Some((start, finish)));
    }

    let key = quote_ident(key_column);
    let query = format!("SELECT MIN({key}), MAX({key}) FROM {table}");
    let (min, max): (Option<i64>, Option<i64>) =
        sqlx::query_as(&query).fetch_one(&mut *conn).await?;

    let start = start.or(min);
    let finish = finish.or(max.map(|m| m + 1));
    Ok(start.zip(finish))
}

/// Reject configurations upfront that either cannot terminate within the
/// loop guard or make no sense at all.
fn unwanted_configuration(start: i64, finish: i64, batch_size: i64) -> bool {
    start > finish
        || batch_size < MIN_BATCH_SIZE
        || (finish.saturating_sub(start)) / batch_size >= MAX_ALLOWED_LOOPS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwanted_configuration_rejects_inverted_bounds() {
        assert!(unwanted_configuration(10, 5, 1_000));
        assert!(!unwanted_configuration(5, 10, 1_000));
    }

    #[test]
    fn unwanted_configuration_rejects_tiny_batches() {
        assert!(unwanted_configuration(0, 1_000, MIN_BATCH_SIZE - 1));
        assert!(!unwanted_configuration(0, 1_000, MIN_BATCH_SIZE));
    }

    #[test]
    fn unwanted_configuration_bounds_iteration_count() {
        // Range requiring exactly MAX_ALLOWED_LOOPS batches is rejected,
        // one batch fewer is accepted.
        let batch = 1_000;
        assert!(unwanted_configuration(0, batch * MAX_ALLOWED_LOOPS, batch));
        assert!(!unwanted_configuration(
            0,
            batch * (MAX_ALLOWED_LOOPS - 1),
            batch
        ));
    }

    #[test]
    fn batch_op_renders_range_predicates() {
        let sql = BatchOp::Count.query("\"public\".\"events\"", "id");
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM \"public\".\"events\" WHERE \"id\" >= $1 AND \"id\" < $2"
        );

        let sql = BatchOp::Sum("size_bytes".to_string()).query("\"public\".\"events\"", "id");
        assert!(sql.contains("COALESCE(SUM(\"size_bytes\"), 0)::BIGINT"));
    }
}
