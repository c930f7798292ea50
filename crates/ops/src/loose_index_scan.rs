//! Distinct counting via a loose index scan.
//!
//! Instead of scanning every row, a recursive CTE jumps from one distinct
//! value directly to the next (`WHERE column > previous ORDER BY column
//! LIMIT 1`), touching one index entry per distinct value. This wins when
//! the column is heavily clustered, with few distinct values over many rows.

use crate::error::OpsResult;
use crate::sql::{quote_ident, quote_qualified};
use sqlx::PgConnection;

/// Loose-index-scan distinct counter over a numeric column.
#[derive(Debug, Clone)]
pub struct LooseIndexScanDistinctCount {
    table: String,
    column: String,
}

impl LooseIndexScanDistinctCount {
    pub fn new(schema: &str, table: &str, column: &str) -> Self {
        Self {
            table: quote_qualified(schema, table),
            column: column.to_string(),
        }
    }

    fn query(&self) -> String {
        let column = quote_ident(&self.column);
        format!(
            "WITH RECURSIVE distinct_values AS ( \
               (SELECT {column} AS value FROM {table} \
                 WHERE {column} IS NOT NULL AND {column} >= $1 AND {column} < $2 \
                 ORDER BY {column} LIMIT 1) \
               UNION ALL \
               SELECT (SELECT {column} FROM {table} \
                        WHERE {column} > dv.value AND {column} < $2 \
                        ORDER BY {column} LIMIT 1) \
               FROM distinct_values dv WHERE dv.value IS NOT NULL \
             ) \
             SELECT COUNT(value) FROM distinct_values",
            table = self.table,
        )
    }

    /// Count distinct values in `[from, to)`; unbounded when `None`.
    pub async fn count(
        &self,
        conn: &mut PgConnection,
        from: Option<i64>,
        to: Option<i64>,
    ) -> OpsResult<i64> {
        let count: i64 = sqlx::query_scalar(&self.query())
            .bind(from.unwrap_or(i64::MIN))
            .bind(to.unwrap_or(i64::MAX))
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }
}
