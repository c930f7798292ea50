//! Index repair tests against live PostgreSQL.

mod common;

use common::db_or_skip;
use steward_core::{ReferenceSpec, RepairTarget};
use steward_ops::repair_index::RepairIndex;

fn plan() -> Vec<RepairTarget> {
    vec![RepairTarget {
        table: "tags".to_string(),
        index: "index_tags_on_name".to_string(),
        columns: vec!["name".to_string()],
        unique: true,
        references: vec![
            ReferenceSpec::Scalar {
                table: "taggings".to_string(),
                column: "tag_id".to_string(),
            },
            ReferenceSpec::Array {
                table: "saved_filters".to_string(),
                column: "tag_ids".to_string(),
            },
            ReferenceSpec::EntityScoped {
                table: "project_tags".to_string(),
                column: "tag_id".to_string(),
                entity_column: "project_id".to_string(),
            },
        ],
    }]
}

/// The canonical corruption scenario: rows 1/'a', 2/'a', 3/'b' where the
/// unique index on name should have prevented id 2. References point at the
/// doomed id 2 through all three reference shapes.
async fn seed(pool: &sqlx::PgPool) {
    sqlx::query("CREATE TABLE tags (id BIGINT PRIMARY KEY, name TEXT)")
        .execute(pool)
        .await
        .expect("create tags failed");
    sqlx::query("INSERT INTO tags (id, name) VALUES (1, 'a'), (2, 'a'), (3, 'b')")
        .execute(pool)
        .await
        .unwrap();

    sqlx::query("CREATE TABLE taggings (id BIGINT PRIMARY KEY, tag_id BIGINT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO taggings (id, tag_id) VALUES (10, 2), (11, 3)")
        .execute(pool)
        .await
        .unwrap();

    sqlx::query("CREATE TABLE saved_filters (id BIGINT PRIMARY KEY, tag_ids BIGINT[] NOT NULL)")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO saved_filters (id, tag_ids) VALUES (20, ARRAY[2, 3]::BIGINT[])")
        .execute(pool)
        .await
        .unwrap();

    sqlx::query(
        "CREATE TABLE project_tags (project_id BIGINT NOT NULL, tag_id BIGINT NOT NULL)",
    )
    .execute(pool)
    .await
    .unwrap();
    // Project 30 references both the canonical and the duplicate id: the
    // duplicate reference must be deleted, not remapped into a collision.
    // Project 31 references only the duplicate, so it must be remapped.
    sqlx::query("INSERT INTO project_tags (project_id, tag_id) VALUES (30, 1), (30, 2), (31, 2)")
        .execute(pool)
        .await
        .unwrap();
}

async fn tag_ids(pool: &sqlx::PgPool) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM tags ORDER BY id")
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn repair_collapses_duplicates_onto_the_lowest_id() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    seed(&db.pool).await;

    let plan = plan();
    let report = RepairIndex::new(&db.pool, &plan).execute().await.unwrap();

    assert_eq!(report.duplicate_groups, 1);
    assert_eq!(report.rows_removed, 1);

    // Lowest id survives per distinct name.
    assert_eq!(tag_ids(&db.pool).await, vec![1, 3]);

    // Scalar reference now points at the canonical row.
    let tagging: i64 = sqlx::query_scalar("SELECT tag_id FROM taggings WHERE id = 10")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(tagging, 1);

    // Array reference remapped element-wise, untouched elements preserved.
    let filter: Vec<i64> = sqlx::query_scalar("SELECT tag_ids FROM saved_filters WHERE id = 20")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(filter, vec![1, 3]);

    // Entity-scoped: project 30's duplicate reference was deleted (it
    // already had the canonical one), project 31's was remapped.
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT project_id, tag_id FROM project_tags ORDER BY project_id, tag_id",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(rows, vec![(30, 1), (31, 1)]);
    assert_eq!(report.conflicting_references_removed, 1);

    // The unique index exists and is valid afterwards.
    let valid: Option<bool> = sqlx::query_scalar(
        "SELECT i.indisvalid FROM pg_index i
         JOIN pg_class c ON c.oid = i.indexrelid
         WHERE c.relname = 'index_tags_on_name'",
    )
    .fetch_optional(&db.pool)
    .await
    .unwrap();
    assert_eq!(valid, Some(true));
}

#[tokio::test]
async fn dry_run_logs_but_never_mutates() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    seed(&db.pool).await;

    let plan = plan();
    let report = RepairIndex::new(&db.pool, &plan)
        .dry_run(true)
        .execute()
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.duplicate_groups, 1);

    // Everything is exactly as seeded.
    assert_eq!(tag_ids(&db.pool).await, vec![1, 2, 3]);
    let taggings: Vec<i64> = sqlx::query_scalar("SELECT tag_id FROM taggings ORDER BY id")
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(taggings, vec![2, 3]);
    let project_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM project_tags")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(project_rows, 3);

    // No index was created either.
    let exists: Option<bool> = sqlx::query_scalar(
        "SELECT i.indisvalid FROM pg_index i
         JOIN pg_class c ON c.oid = i.indexrelid
         WHERE c.relname = 'index_tags_on_name'",
    )
    .fetch_optional(&db.pool)
    .await
    .unwrap();
    assert_eq!(exists, None);
}

#[tokio::test]
async fn repair_is_idempotent() {
    let Some(db) = db_or_skip().await else {
        return;
    };
    seed(&db.pool).await;

    let plan = plan();
    RepairIndex::new(&db.pool, &plan).execute().await.unwrap();
    let second = RepairIndex::new(&db.pool, &plan).execute().await.unwrap();

    assert_eq!(second.duplicate_groups, 0);
    assert_eq!(second.rows_removed, 0);
    assert_eq!(tag_ids(&db.pool).await, vec![1, 3]);
}
