//! Lock retry engine.
//!
//! Executes a unit of work inside its own short-`lock_timeout` transaction,
//! retrying on lock-wait failures with an escalating timeout/backoff
//! schedule, and falling back to one unbounded attempt as a last resort
//! (unless the caller opts into a hard failure instead).
//!
//! Every attempt runs on a dedicated pooled connection whose session
//! settings (`lock_timeout`, `idle_in_transaction_session_timeout`) are set
//! before and reset after the run, including on the error path, so nothing
//! leaks into the pool. The engine owns its connection for the whole run;
//! lock-retry scopes do not nest.

use crate::error::{OpsError, OpsResult};
use futures::future::BoxFuture;
use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use steward_core::RetryPolicy;

/// The future a unit of work returns, borrowing the attempt's connection.
pub type LockedWork<'c> = BoxFuture<'c, OpsResult<()>>;

/// Retryable lock acquisition around a unit of work.
#[derive(Debug, Clone)]
pub struct WithLockRetries {
    policy: RetryPolicy,
    raise_on_exhaustion: bool,
}

impl WithLockRetries {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            raise_on_exhaustion: false,
        }
    }

    /// Fail with [`OpsError::AttemptsExhausted`] once the schedule runs out
    /// instead of taking the unbounded final attempt. Destructive DDL
    /// (partition attach/detach) always sets this.
    pub fn raise_on_exhaustion(mut self, raise: bool) -> Self {
        self.raise_on_exhaustion = raise;
        self
    }

    /// Run `work` under the retry schedule. `work` is invoked once per
    /// attempt with a connection that already has an open transaction; the
    /// engine commits on success and rolls back on any error.
    ///
    /// Only lock-wait timeouts (SQLSTATE 55P03) are retried; every other
    /// error propagates immediately after rollback.
    pub async fn run<F>(&self, pool: &PgPool, work: F) -> OpsResult<()>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> LockedWork<'c>,
    {
        let mut conn = pool.acquire().await.map_err(OpsError::from)?;

        let result = self.run_on(&mut conn, &work).await;

        // Settings must not leak back into the pool, error or not.
        if let Err(reset_err) = reset_session_settings(&mut conn).await {
            tracing::warn!(error = %reset_err, "failed to reset session settings after lock retry run");
        }

        result
    }

    /// Convenience wrapper: execute a fixed statement list under retries.
    pub async fn run_statements(&self, pool: &PgPool, statements: &[String]) -> OpsResult<()> {
        self.run(pool, |conn| {
            let statements = statements.to_vec();
            Box::pin(async move {
                for statement in &statements {
                    sqlx::query(statement).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn run_on<F>(&self, conn: &mut PgConnection, work: &F) -> OpsResult<()>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> LockedWork<'c>,
    {
        if self.policy.is_disabled() {
            tracing::warn!("lock retries disabled; executing a single unguarded attempt");
            return attempt(conn, None, work).await;
        }

        // The backoff sleeps between attempts must not trip the idle
        // transaction reaper on this session.
        sqlx::query("SET idle_in_transaction_session_timeout TO 0")
            .execute(&mut *conn)
            .await?;

        let steps = self.policy.steps();
        for (iteration, step) in steps.iter().enumerate() {
            match attempt(conn, Some(step.lock_timeout), work).await {
                Ok(()) => {
                    if iteration > 0 {
                        tracing::info!(attempts = iteration + 1, "lock acquired after retries");
                    }
                    return Ok(());
                }
                Err(err) if err.is_lock_timeout() => {
                    tracing::warn!(
                        attempt = iteration + 1,
                        of = steps.len(),
                        lock_timeout_ms = step.lock_timeout.as_millis() as u64,
                        sleep_ms = step.sleep.as_millis() as u64,
                        "lock not obtained within timeout"
                    );
                    tokio::time::sleep(step.sleep).await;
                }
                Err(other) => return Err(other),
            }
        }

        if self.raise_on_exhaustion {
            return Err(OpsError::AttemptsExhausted {
                attempts: steps.len(),
            });
        }

        tracing::warn!("retry schedule exhausted; final attempt with no lock timeout");
        attempt(conn, None, work).await
    }
}

/// One attempt: set the session `lock_timeout` (0 = wait forever), open a
/// transaction, run the work, commit or roll back.
async fn attempt<F>(
    conn: &mut PgConnection,
    lock_timeout: Option<Duration>,
    work: &F,
) -> OpsResult<()>
where
    F: for<'c> Fn(&'c mut PgConnection) -> LockedWork<'c>,
{
    let set_timeout = match lock_timeout {
        Some(timeout) => format!("SET lock_timeout TO '{}ms'", timeout.as_millis()),
        None => "SET lock_timeout TO 0".to_string(),
    };
    sqlx::query(&set_timeout).execute(&mut *conn).await?;

    let mut tx = conn.begin().await.map_err(OpsError::from)?;
    match work(&mut *tx).await {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed after errored attempt");
            }
            Err(err)
        }
    }
}

async fn reset_session_settings(conn: &mut PgConnection) -> OpsResult<()> {
    sqlx::query("RESET lock_timeout").execute(&mut *conn).await?;
    sqlx::query("RESET idle_in_transaction_session_timeout")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
