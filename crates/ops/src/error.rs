//! Operations engine error types.
//!
//! The taxonomy distinguishes expected transient failures (lock waits,
//! query cancellation) from structural precondition violations and from
//! everything else. Transient variants are produced by classifying
//! PostgreSQL SQLSTATEs out of the raw driver error.

use thiserror::Error;

/// SQLSTATE for `lock_not_available` (raised when `lock_timeout` expires).
pub const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE for `query_canceled` (raised when `statement_timeout` expires
/// or the backend is cancelled).
pub const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Operations engine error type.
#[derive(Debug, Error)]
pub enum OpsError {
    /// A statement waited longer than `lock_timeout` for a lock. Expected
    /// and transient; the lock retry engine retries these per its schedule.
    #[error("lock wait timeout: {0}")]
    LockTimeout(sqlx::Error),

    /// The backend cancelled the statement (statement timeout or explicit
    /// cancel). Batch engines react by shrinking their batch size.
    #[error("query canceled: {0}")]
    QueryCanceled(sqlx::Error),

    /// The retry schedule ran out without obtaining the lock, and the caller
    /// asked for no unbounded fallback. Distinct from `LockTimeout` so
    /// callers can tell "still locked after bounded effort" apart from an
    /// individual failed attempt.
    #[error("lock retries exhausted after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },

    /// A structural precondition does not hold (wrong partition state,
    /// missing constraint, disallowed name, unsupported index). Never
    /// retried; retrying cannot fix a structural problem.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Concurrent reindexing failed (invalid shadow index, failed swap).
    #[error("reindex error: {0}")]
    Reindex(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Any other database error. Always propagated, never swallowed.
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Result type for operations.
pub type OpsResult<T> = std::result::Result<T, OpsError>;

impl From<sqlx::Error> for OpsError {
    fn from(err: sqlx::Error) -> Self {
        match sqlstate(&err).as_deref() {
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) => Self::LockTimeout(err),
            Some(SQLSTATE_QUERY_CANCELED) => Self::QueryCanceled(err),
            _ => Self::Database(err),
        }
    }
}

impl From<steward_core::Error> for OpsError {
    fn from(err: steward_core::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Extract the SQLSTATE from a driver error, if it carries one.
fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.to_string()),
        _ => None,
    }
}

impl OpsError {
    /// True for the transient lock-wait variant only.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }

    /// True for the transient statement-cancellation variant only.
    pub fn is_query_canceled(&self) -> bool {
        matches!(self, Self::QueryCanceled(_))
    }
}
