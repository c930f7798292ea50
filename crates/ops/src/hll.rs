//! Probabilistic distinct counting via HyperLogLog.
//!
//! The bucketing runs SQL-side: each batch hashes its values to 32 bits with
//! `hashtext`, partitions them into 512 buckets by the low-order bits, and
//! reports the best (largest) leading-zero proxy seen per bucket. Batches
//! merge into an [`HllSketch`] by per-bucket max, so merging is monotonic
//! and order-independent. The final estimate applies the standard
//! bias-corrected harmonic mean, switching to linear counting for small
//! cardinalities.
//!
//! Observed error on synthetic data sits around 5%; that figure is an
//! empirical observation validated by tests, not a guaranteed bound.

use crate::error::{OpsError, OpsResult};
use crate::session::ensure_not_in_transaction;
use crate::sql::{quote_ident, quote_qualified};
use sqlx::PgConnection;
use std::collections::BTreeMap;

pub const TOTAL_BUCKETS: usize = 512;

/// Mask selecting the bucket id from the low 9 bits of the hash.
const BUCKET_MASK: i32 = (TOTAL_BUCKETS as i32) - 1;

/// Mask stripping the sign bit so `log(2, ...)` sees a positive value.
const BIT_31_MASK: i64 = 0x7FFF_FFFF;

/// Sentinel returned when the estimation run trips its guard rails.
pub const FALLBACK: i64 = -1;

/// A 512-bucket HyperLogLog sketch: bucket id to largest leading-zero proxy
/// observed. Entries only ever grow, so merging partial sketches commutes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HllSketch {
    buckets: BTreeMap<i32, i32>,
}

impl HllSketch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one `(bucket, value)` observation into the sketch, keeping the
    /// per-bucket maximum.
    pub fn observe(&mut self, bucket: i32, value: i32) {
        let slot = self.buckets.entry(bucket).or_insert(value);
        if *slot < value {
            *slot = value;
        }
    }

    /// Merge another sketch into this one (per-bucket max).
    pub fn merge(&mut self, other: &HllSketch) {
        for (&bucket, &value) in &other.buckets {
            self.observe(bucket, value);
        }
    }

    pub fn occupied_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Bias-corrected cardinality estimate.
    pub fn estimate(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }

        let m = TOTAL_BUCKETS as f64;
        let empty_buckets = (TOTAL_BUCKETS - self.buckets.len()) as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let harmonic_sum: f64 = self
            .buckets
            .values()
            .map(|&value| 2.0_f64.powi(-value))
            .sum::<f64>()
            + empty_buckets;

        let raw = alpha * m * m / harmonic_sum;

        // Linear counting handles the small-cardinality regime where the
        // harmonic estimator is biased high.
        if empty_buckets > 0.0 && raw < 2.5 * m {
            m * (m / empty_buckets).ln()
        } else {
            raw
        }
    }
}

/// Batched HyperLogLog distinct counter.
///
/// Ranges over a numeric key column in batches like [`crate::batch_count`],
/// but each batch contributes a partial sketch instead of an exact count.
#[derive(Debug, Clone)]
pub struct HllBatchDistinctCounter {
    table: String,
    column: String,
    key_column: String,
    batch_size: i64,
}

pub const DEFAULT_HLL_BATCH_SIZE: i64 = 10_000;

impl HllBatchDistinctCounter {
    /// Estimate distinct values of `column`, batching over `key_column`.
    pub fn new(schema: &str, table: &str, column: &str, key_column: &str) -> Self {
        Self {
            table: quote_qualified(schema, table),
            column: column.to_string(),
            key_column: key_column.to_string(),
            batch_size: DEFAULT_HLL_BATCH_SIZE,
        }
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn bucket_query(&self) -> String {
        let column = quote_ident(&self.column);
        let key = quote_ident(&self.key_column);
        format!(
            "SELECT (h & {BUCKET_MASK})::INT AS bucket_num, \
             (31 - FLOOR(LOG(2.0, GREATEST(MIN(h & {BIT_31_MASK}), 1))))::INT AS bucket_hash \
             FROM (SELECT HASHTEXT(({column})::TEXT) AS h FROM {table} \
                   WHERE {column} IS NOT NULL AND {key} >= $1 AND {key} < $2) hashed \
             GROUP BY 1",
            table = self.table,
        )
    }

    /// Build the merged sketch across all batches. `None` means a guard
    /// rail tripped (loop cap, or batch size shrank below the floor).
    pub async fn sketch(&self, conn: &mut PgConnection) -> OpsResult<Option<HllSketch>> {
        ensure_not_in_transaction(conn).await?;

        let key = quote_ident(&self.key_column);
        let bounds_query = format!("SELECT MIN({key}), MAX({key}) FROM {}", self.table);
        let (min, max): (Option<i64>, Option<i64>) =
            sqlx::query_as(&bounds_query).fetch_one(&mut *conn).await?;

        let mut sketch = HllSketch::new();
        let (Some(min), Some(max)) = (min, max) else {
            return Ok(Some(sketch));
        };

        let mut batch_size = self.batch_size;
        let query = self.bucket_query();
        let finish = max + 1;
        let mut batch_start = min;
        let mut loops: i64 = 0;

        while batch_start < finish {
            loops += 1;
            if loops > crate::batch_count::MAX_ALLOWED_LOOPS {
                tracing::warn!(table = %self.table, loops, "loop guard exceeded, aborting estimation");
                return Ok(None);
            }

            let batch_end = batch_start.saturating_add(batch_size).min(finish);
            match sqlx::query_as::<_, (i32, i32)>(&query)
                .bind(batch_start)
                .bind(batch_end)
                .fetch_all(&mut *conn)
                .await
            {
                Ok(rows) => {
                    for (bucket, value) in rows {
                        sketch.observe(bucket, value);
                    }
                    batch_start = batch_end;
                }
                Err(err) => {
                    let err = OpsError::from(err);
                    if !err.is_query_canceled() {
                        return Err(err);
                    }
                    batch_size /= 2;
                    if batch_size < crate::batch_count::MIN_BATCH_SIZE {
                        tracing::warn!(table = %self.table, "batch size shrank below floor, aborting estimation");
                        return Ok(None);
                    }
                    continue;
                }
            }

            tokio::time::sleep(crate::batch_count::SLEEP_BETWEEN_BATCHES).await;
        }

        Ok(Some(sketch))
    }

    /// Estimated distinct count. Returns [`FALLBACK`] when the run could not
    /// complete within its guard rails.
    pub async fn estimate(&self, conn: &mut PgConnection) -> OpsResult<i64> {
        match self.sketch(conn).await? {
            Some(sketch) => Ok(sketch.estimate().round() as i64),
            None => Ok(FALLBACK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference hash matching PostgreSQL's role here: any well-mixed 32-bit
    /// hash works for exercising the estimator math.
    fn mix32(mut x: u64) -> i32 {
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 33;
        x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
        x ^= x >> 33;
        (x as u32) as i32
    }

    fn sketch_of(cardinality: u64) -> HllSketch {
        let mut sketch = HllSketch::new();
        for element in 0..cardinality {
            let h = mix32(element);
            let bucket = h & BUCKET_MASK;
            let positive = ((h as i64) & BIT_31_MASK).max(1) as u64;
            let floor_log2 = 63 - positive.leading_zeros() as i32;
            sketch.observe(bucket, 31 - floor_log2);
        }
        sketch
    }

    #[test]
    fn empty_sketch_estimates_zero() {
        assert_eq!(HllSketch::new().estimate(), 0.0);
    }

    #[test]
    fn estimate_tracks_known_cardinalities_within_tolerance() {
        for &cardinality in &[100_u64, 1_000, 10_000, 100_000] {
            let estimate = sketch_of(cardinality).estimate();
            let error = (estimate - cardinality as f64).abs() / cardinality as f64;
            assert!(
                error < 0.08,
                "cardinality {cardinality}: estimate {estimate:.0} off by {:.1}%",
                error * 100.0
            );
        }
    }

    #[test]
    fn merge_is_monotonic_and_commutative() {
        let mut a = HllSketch::new();
        a.observe(3, 5);
        a.observe(7, 2);

        let mut b = HllSketch::new();
        b.observe(3, 9);
        b.observe(11, 1);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);

        // Bucket 3 kept the larger observation.
        let mut expected = HllSketch::new();
        expected.observe(3, 9);
        expected.observe(7, 2);
        expected.observe(11, 1);
        assert_eq!(ab, expected);
    }

    #[test]
    fn observe_never_lowers_a_bucket() {
        let mut sketch = HllSketch::new();
        sketch.observe(0, 7);
        sketch.observe(0, 3);
        let mut expected = HllSketch::new();
        expected.observe(0, 7);
        assert_eq!(sketch, expected);
    }

    #[test]
    fn bucket_query_shape() {
        let counter = HllBatchDistinctCounter::new("public", "events", "user_id", "id");
        let sql = counter.bucket_query();
        assert!(sql.contains("HASHTEXT((\"user_id\")::TEXT)"));
        assert!(sql.contains("GROUP BY 1"));
        assert!(sql.contains("\"id\" >= $1 AND \"id\" < $2"));
    }
}
