//! Session-level setting guards shared by the maintenance operations.

use crate::error::{OpsError, OpsResult};
use sqlx::PgConnection;

/// Verify the connection is not inside an explicitly opened transaction.
///
/// Batch engines hold no transaction across their long loops; running one
/// inside a caller's transaction would pin an xmin horizon and hold locks for
/// the whole scan. The probe compares `transaction_timestamp()` with
/// `statement_timestamp()`: inside an open transaction that has already
/// executed a statement, the two differ.
pub async fn ensure_not_in_transaction(conn: &mut PgConnection) -> OpsResult<()> {
    let in_transaction: bool =
        sqlx::query_scalar("SELECT transaction_timestamp() <> statement_timestamp()")
            .fetch_one(&mut *conn)
            .await?;

    if in_transaction {
        return Err(OpsError::Precondition(
            "batch counting must not run inside an open transaction".to_string(),
        ));
    }
    Ok(())
}

/// Lift `statement_timeout` for the current session. Used around concurrent
/// index builds, which legitimately run longer than any OLTP statement
/// budget. Callers must pair this with [`restore_statement_timeout`].
pub async fn disable_statement_timeout(conn: &mut PgConnection) -> OpsResult<()> {
    sqlx::query("SET statement_timeout TO 0")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Restore the session's default `statement_timeout`.
pub async fn restore_statement_timeout(conn: &mut PgConnection) -> OpsResult<()> {
    sqlx::query("RESET statement_timeout")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
