//! Session-level advisory locks.
//!
//! Maintenance runs (reindex sweeps, repair runs) use an advisory lock to
//! serialize themselves against concurrent invocations of the same tooling,
//! without touching any table row. Keys are namespaced so unrelated tools
//! sharing the database cannot collide.

use crate::error::OpsResult;
use sqlx::PgConnection;

/// Namespace discriminator for Steward's advisory keys.
const KEY_NAMESPACE: i32 = 0x53_54_45_57; // "STEW"

/// A typed advisory lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvisoryLock {
    key: i32,
}

impl AdvisoryLock {
    /// Well-known key: one concurrent reindexing run per database.
    pub const REINDEXING: AdvisoryLock = AdvisoryLock { key: 1 };

    /// Well-known key: one concurrent index repair run per database.
    pub const INDEX_REPAIR: AdvisoryLock = AdvisoryLock { key: 2 };

    pub const fn new(key: i32) -> Self {
        Self { key }
    }

    /// Try to take the lock without waiting. The lock is tied to the
    /// connection's session and must be released on the same connection.
    pub async fn try_acquire(&self, conn: &mut PgConnection) -> OpsResult<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(KEY_NAMESPACE)
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            tracing::warn!(key = self.key, "advisory lock already held elsewhere");
        }
        Ok(acquired)
    }

    /// Release the lock. Returns false if this session did not hold it.
    pub async fn release(&self, conn: &mut PgConnection) -> OpsResult<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
            .bind(KEY_NAMESPACE)
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(released)
    }
}
