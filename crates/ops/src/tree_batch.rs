//! Resumable depth-first batch iteration over a hierarchical table.
//!
//! Walks a parent/child table (`id`, `parent_id`) depth-first, yielding
//! batches of ids, with one recursive CTE execution per batch. The cursor,
//! the current node plus the ancestor path, is a plain serializable value,
//! so a traversal can stop at any batch boundary and resume later, or on
//! another host.
//!
//! Each recursion step resolves exactly one move out of three candidates,
//! in priority order:
//!
//! 1. *walk down*: the left-most unvisited child of the current node,
//! 2. *next sibling*: the next node at the deepest unresolved level,
//! 3. *up a level*: pop the ancestor path.
//!
//! The three branches are built by independent fragment functions and
//! composed into a `LATERAL` three-way union ordered by priority with
//! `LIMIT 1`. Traversal ends when the ancestor path empties.

use crate::error::{OpsError, OpsResult};
use crate::sql::{quote_ident, quote_qualified};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

/// Serializable resume point: the node the walk stopped on plus the
/// ancestor path down to it (the path includes the node itself).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeCursor {
    pub current_id: Option<i64>,
    pub depth: Vec<i64>,
}

/// Builds the per-step traversal query from its three branch fragments.
#[derive(Debug, Clone)]
struct TreeQueryBuilder {
    table: String,
    id: String,
    parent: String,
}

impl TreeQueryBuilder {
    fn new(schema: &str, table: &str, id_column: &str, parent_column: &str) -> Self {
        Self {
            table: quote_qualified(schema, table),
            id: quote_ident(id_column),
            parent: quote_ident(parent_column),
        }
    }

    /// Branch 1: the left-most child of the current node. Disabled after an
    /// upward move (current is NULL), so finished subtrees are not re-entered.
    fn walk_down_fragment(&self) -> String {
        format!(
            "SELECT n.{id} AS next_id, walk.depth || n.{id} AS next_depth, 1 AS priority \
             FROM {table} n \
             WHERE walk.current_id IS NOT NULL AND n.{parent} = walk.current_id \
             ORDER BY n.{id} LIMIT 1",
            id = self.id,
            parent = self.parent,
            table = self.table,
        )
    }

    /// Branch 2: the next sibling at the deepest unresolved level. At the
    /// root level "sibling" means the next root (parent IS NULL).
    fn next_sibling_fragment(&self) -> String {
        format!(
            "SELECT n.{id}, walk.depth[1:CARDINALITY(walk.depth) - 1] || n.{id}, 2 \
             FROM {table} n \
             WHERE ((CARDINALITY(walk.depth) > 1 AND n.{parent} = walk.depth[CARDINALITY(walk.depth) - 1]) \
                 OR (CARDINALITY(walk.depth) = 1 AND n.{parent} IS NULL)) \
               AND n.{id} > walk.depth[CARDINALITY(walk.depth)] \
             ORDER BY n.{id} LIMIT 1",
            id = self.id,
            parent = self.parent,
            table = self.table,
        )
    }

    /// Branch 3: pop one level. Always produces a row, so a step can never
    /// come back empty while the path is non-empty.
    fn up_level_fragment(&self) -> String {
        "SELECT NULL::BIGINT, walk.depth[1:CARDINALITY(walk.depth) - 1], 3".to_string()
    }

    /// The full per-batch recursive query.
    ///
    /// Binds: `$1` current id (nullable), `$2` depth path, `$3` initial ids,
    /// `$4` batch size cap.
    fn batch_query(&self) -> String {
        format!(
            "WITH RECURSIVE walk AS ( \
               SELECT $1::BIGINT AS current_id, $2::BIGINT[] AS depth, $3::BIGINT[] AS ids, 1 AS step \
               UNION ALL \
               SELECT next.next_id, \
                      next.next_depth, \
                      CASE WHEN next.next_id IS NULL THEN walk.ids ELSE walk.ids || next.next_id END, \
                      walk.step + 1 \
               FROM walk, LATERAL ( \
                 SELECT * FROM ( \
                   ({down}) UNION ALL ({sideways}) UNION ALL ({up}) \
                 ) candidates ORDER BY priority LIMIT 1 \
               ) next \
               WHERE CARDINALITY(walk.depth) > 0 AND CARDINALITY(walk.ids) < $4 \
             ) \
             SELECT current_id, depth, ids FROM walk ORDER BY step DESC LIMIT 1",
            down = self.walk_down_fragment(),
            sideways = self.next_sibling_fragment(),
            up = self.up_level_fragment(),
        )
    }
}

/// Depth-first batch iterator over one hierarchical table.
pub struct TreeBatchIterator<'a> {
    conn: &'a mut PgConnection,
    builder: TreeQueryBuilder,
    cursor: TreeCursor,
    first_call: bool,
    done: bool,
}

impl<'a> TreeBatchIterator<'a> {
    /// Start a fresh depth-first walk at `start_id` (normally the smallest
    /// root). The start node itself is yielded in the first batch.
    pub fn new(
        conn: &'a mut PgConnection,
        schema: &str,
        table: &str,
        id_column: &str,
        parent_column: &str,
        start_id: i64,
    ) -> Self {
        Self {
            conn,
            builder: TreeQueryBuilder::new(schema, table, id_column, parent_column),
            cursor: TreeCursor {
                current_id: Some(start_id),
                depth: vec![start_id],
            },
            first_call: true,
            done: false,
        }
    }

    /// Resume a walk from a cursor persisted by a previous run. Ids already
    /// yielded before the cursor was taken are not yielded again.
    pub fn with_cursor(
        conn: &'a mut PgConnection,
        schema: &str,
        table: &str,
        id_column: &str,
        parent_column: &str,
        cursor: TreeCursor,
    ) -> Self {
        let done = cursor.depth.is_empty();
        Self {
            conn,
            builder: TreeQueryBuilder::new(schema, table, id_column, parent_column),
            cursor,
            first_call: false,
            done,
        }
    }

    /// The cursor to persist for resumption.
    pub fn cursor(&self) -> &TreeCursor {
        &self.cursor
    }

    /// Fetch the next batch of at most `of` ids; `None` once exhausted.
    pub async fn next_batch(&mut self, of: usize) -> OpsResult<Option<Vec<i64>>> {
        if of == 0 {
            return Err(OpsError::Precondition(
                "tree batch size must be at least 1".to_string(),
            ));
        }
        if self.done {
            return Ok(None);
        }

        // Only the very first call of a fresh walk seeds the ids with the
        // start node; afterwards every batch accumulates from empty.
        let initial_ids: Vec<i64> = if self.first_call {
            self.cursor.depth.last().copied().into_iter().collect()
        } else {
            Vec::new()
        };
        self.first_call = false;

        let query = self.builder.batch_query();
        let (current_id, depth, ids): (Option<i64>, Vec<i64>, Vec<i64>) = sqlx::query_as(&query)
            .bind(self.cursor.current_id)
            .bind(self.cursor.depth.clone())
            .bind(initial_ids)
            .bind(of as i64)
            .fetch_one(&mut *self.conn)
            .await?;

        self.cursor = TreeCursor { current_id, depth };
        if self.cursor.depth.is_empty() {
            self.done = true;
        }

        if ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(ids))
    }

    /// Drain the full traversal into one vector. Test and small-tree helper.
    pub async fn collect_all(&mut self, of: usize) -> OpsResult<Vec<i64>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch(of).await? {
            all.extend(batch);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> TreeQueryBuilder {
        TreeQueryBuilder::new("public", "namespaces", "id", "parent_id")
    }

    #[test]
    fn walk_down_requires_a_current_node() {
        let sql = builder().walk_down_fragment();
        assert!(sql.contains("walk.current_id IS NOT NULL"));
        assert!(sql.contains("n.\"parent_id\" = walk.current_id"));
        assert!(sql.ends_with("ORDER BY n.\"id\" LIMIT 1"));
    }

    #[test]
    fn sibling_fragment_handles_root_level() {
        let sql = builder().next_sibling_fragment();
        // Children: parent is the second-to-last path entry.
        assert!(sql.contains("n.\"parent_id\" = walk.depth[CARDINALITY(walk.depth) - 1]"));
        // Roots: no parent at all.
        assert!(sql.contains("CARDINALITY(walk.depth) = 1 AND n.\"parent_id\" IS NULL"));
        // Strictly after the node the level stopped on.
        assert!(sql.contains("n.\"id\" > walk.depth[CARDINALITY(walk.depth)]"));
    }

    #[test]
    fn up_level_always_yields_a_row() {
        let sql = builder().up_level_fragment();
        assert!(sql.starts_with("SELECT NULL::BIGINT"));
        assert!(!sql.contains("FROM"));
    }

    #[test]
    fn batch_query_prioritizes_down_over_sideways_over_up() {
        let sql = builder().batch_query();
        let down = sql.find("1 AS priority").unwrap();
        let sideways = sql.find(", 2 ").unwrap();
        let up = sql.find(", 3").unwrap();
        assert!(down < sideways && sideways < up);
        assert!(sql.contains("ORDER BY priority LIMIT 1"));
        assert!(sql.contains("CARDINALITY(walk.ids) < $4"));
    }
}
