//! Schema drift, collation, and advisory lock tests against live PostgreSQL.

mod common;

use common::db_or_skip;
use std::collections::BTreeMap;
use steward_core::{CollationCheckConfig, ExpectedSchema, RiskyIndex};
use steward_ops::advisory_lock::AdvisoryLock;
use steward_ops::collation::CollationChecker;
use steward_ops::schema_check::SchemaChecker;

fn expected_schema() -> ExpectedSchema {
    let mut tables = BTreeMap::new();
    tables.insert(
        "events".to_string(),
        vec!["id".to_string(), "state".to_string(), "missing_col".to_string()],
    );
    tables.insert("absent_table".to_string(), vec!["id".to_string()]);
    ExpectedSchema {
        tables,
        indexes: vec!["idx_events_on_state".to_string(), "idx_never_created".to_string()],
    }
}

#[tokio::test]
async fn schema_checker_reports_every_drift_class() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    sqlx::query("CREATE TABLE events (id BIGINT PRIMARY KEY, state TEXT, surprise TEXT)")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE unexpected (id BIGINT)")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("CREATE INDEX idx_events_on_state ON events (state)")
        .execute(&db.pool)
        .await
        .unwrap();
    let mut conn = db.pool.acquire().await.unwrap();

    let expected = expected_schema();
    let report = SchemaChecker::new(&expected)
        .execute(&mut conn)
        .await
        .unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.missing_tables, vec!["absent_table"]);
    assert_eq!(report.extra_tables, vec!["unexpected"]);
    assert_eq!(report.missing_columns, vec!["events.missing_col"]);
    assert_eq!(report.extra_columns, vec!["events.surprise"]);
    assert_eq!(report.missing_indexes, vec!["idx_never_created"]);
    // The primary key index shows up as live-but-unexpected.
    assert!(report.extra_indexes.contains(&"events_pkey".to_string()));
}

#[tokio::test]
async fn schema_checker_is_clean_on_an_exact_match() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    sqlx::query("CREATE TABLE events (id BIGINT, state TEXT)")
        .execute(&db.pool)
        .await
        .unwrap();
    let mut conn = db.pool.acquire().await.unwrap();

    let mut tables = BTreeMap::new();
    tables.insert(
        "events".to_string(),
        vec!["id".to_string(), "state".to_string()],
    );
    let expected = ExpectedSchema {
        tables,
        indexes: vec![],
    };
    let report = SchemaChecker::new(&expected)
        .execute(&mut conn)
        .await
        .unwrap();
    assert!(report.is_clean(), "unexpected drift: {report:?}");
}

#[tokio::test]
async fn collation_checker_spots_duplicate_keys_in_risky_indexes() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    // Two rows that a healthy unique index would have rejected.
    sqlx::query("CREATE TABLE users (id BIGINT PRIMARY KEY, email TEXT)")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO users (id, email) VALUES (1, 'a@example.com'), (2, 'a@example.com'), (3, NULL)",
    )
    .execute(&db.pool)
    .await
    .unwrap();
    let mut conn = db.pool.acquire().await.unwrap();

    let config = CollationCheckConfig {
        risky_indexes: vec![RiskyIndex {
            table: "users".to_string(),
            index: "index_users_on_email".to_string(),
            columns: vec!["email".to_string()],
        }],
    };
    let report = CollationChecker::new(&config.risky_indexes)
        .execute(&mut conn)
        .await
        .unwrap();

    assert_eq!(report.corrupted_indexes.len(), 1);
    assert_eq!(report.corrupted_indexes[0].duplicate_groups, 1);
    assert!(!report.remediation.is_empty());
    assert!(!report.is_clean());
}

#[tokio::test]
async fn collation_checker_is_quiet_on_a_healthy_database() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    sqlx::query("CREATE TABLE users (id BIGINT PRIMARY KEY, email TEXT)")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO users (id, email) VALUES (1, 'a@example.com'), (2, 'b@example.com')")
        .execute(&db.pool)
        .await
        .unwrap();
    let mut conn = db.pool.acquire().await.unwrap();

    let config = CollationCheckConfig {
        risky_indexes: vec![RiskyIndex {
            table: "users".to_string(),
            index: "index_users_on_email".to_string(),
            columns: vec!["email".to_string()],
        }],
    };
    let report = CollationChecker::new(&config.risky_indexes)
        .execute(&mut conn)
        .await
        .unwrap();

    // A fresh container has no version drift and the data has no duplicates.
    assert!(report.corrupted_indexes.is_empty());
}

#[tokio::test]
async fn advisory_lock_is_exclusive_across_sessions() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    let mut holder = db.pool.acquire().await.unwrap();
    let mut contender = db.pool.acquire().await.unwrap();

    let lock = AdvisoryLock::REINDEXING;
    assert!(lock.try_acquire(&mut holder).await.unwrap());
    assert!(!lock.try_acquire(&mut contender).await.unwrap());

    assert!(lock.release(&mut holder).await.unwrap());
    assert!(lock.try_acquire(&mut contender).await.unwrap());
    assert!(lock.release(&mut contender).await.unwrap());

    // A different key never contends.
    assert!(AdvisoryLock::INDEX_REPAIR.try_acquire(&mut holder).await.unwrap());
    assert!(AdvisoryLock::INDEX_REPAIR.release(&mut holder).await.unwrap());
}
