//! Typed reads over the PostgreSQL system catalogs.
//!
//! Every row shape coming back from a catalog query is a named struct with
//! an explicit mapping, and state is always read fresh at the start of an
//! operation. Concurrent DDL can invalidate it at any time, so nothing
//! here is cached across calls.

use crate::error::OpsResult;
use serde::Serialize;
use sqlx::{FromRow, PgConnection};

/// One index as seen by `pg_index`.
#[derive(Debug, Clone, FromRow)]
pub struct IndexInfo {
    pub schema: String,
    pub name: String,
    pub table: String,
    pub is_unique: bool,
    pub is_valid: bool,
    pub definition: String,
}

/// Look up an index by schema and name.
pub async fn index_info(
    conn: &mut PgConnection,
    schema: &str,
    name: &str,
) -> OpsResult<Option<IndexInfo>> {
    let info = sqlx::query_as::<_, IndexInfo>(
        r#"
        SELECT n.nspname AS schema,
               c.relname AS name,
               t.relname AS "table",
               i.indisunique AS is_unique,
               i.indisvalid AS is_valid,
               pg_get_indexdef(i.indexrelid) AS definition
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indexrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_class t ON t.oid = i.indrelid
        WHERE n.nspname = $1 AND c.relname = $2
        "#,
    )
    .bind(schema)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(info)
}

/// Whether a relation (table or partition) exists.
pub async fn table_exists(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> OpsResult<bool> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
        )
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}

/// Whether `partition` is currently attached to `parent`.
pub async fn is_partition_attached(
    conn: &mut PgConnection,
    schema: &str,
    partition: &str,
    parent: &str,
) -> OpsResult<bool> {
    let attached: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM pg_inherits i
            JOIN pg_class child ON child.oid = i.inhrelid
            JOIN pg_namespace cn ON cn.oid = child.relnamespace
            JOIN pg_class parent ON parent.oid = i.inhparent
            JOIN pg_namespace pn ON pn.oid = parent.relnamespace
            WHERE cn.nspname = $1 AND child.relname = $2
              AND pn.nspname = $1 AND parent.relname = $3
        )
        "#,
    )
    .bind(schema)
    .bind(partition)
    .bind(parent)
    .fetch_one(&mut *conn)
    .await?;
    Ok(attached)
}

/// A CHECK constraint on a table.
#[derive(Debug, Clone, FromRow)]
pub struct CheckConstraint {
    pub name: String,
    pub definition: String,
}

/// All CHECK constraints on `schema.table`.
pub async fn check_constraints(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> OpsResult<Vec<CheckConstraint>> {
    let constraints = sqlx::query_as::<_, CheckConstraint>(
        r#"
        SELECT con.conname AS name,
               pg_get_constraintdef(con.oid) AS definition
        FROM pg_constraint con
        JOIN pg_class c ON c.oid = con.conrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'c'
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;
    Ok(constraints)
}

/// A collation whose stored version no longer matches what the OS provides.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CollationVersionDrift {
    pub name: String,
    pub provider: String,
    pub stored_version: Option<String>,
    pub actual_version: Option<String>,
}

/// Collations with version drift: the signature of an OS upgrade having
/// changed libc/ICU sort order underneath existing indexes.
pub async fn outdated_collations(
    conn: &mut PgConnection,
) -> OpsResult<Vec<CollationVersionDrift>> {
    let rows = sqlx::query_as::<_, CollationVersionDrift>(
        r#"
        SELECT collname AS name,
               collprovider::TEXT AS provider,
               collversion AS stored_version,
               pg_collation_actual_version(oid) AS actual_version
        FROM pg_collation
        WHERE collprovider IN ('c', 'i')
          AND collversion IS DISTINCT FROM pg_collation_actual_version(oid)
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
