use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row};
use tracing::warn;

use super::{TagStore, TagWriter};
use crate::error::{StoreError, StoreResult};
use crate::utils::{from_millis, to_millis};
use crate::{Database, EntryId, TagId, TagNode, TagRow};

/// [`TagStore`] backed by a single SQLite connection.
///
/// The connection is serialized behind a mutex; each transaction holds it for
/// its whole duration.
pub struct SqliteTagStore {
    db: Mutex<Database>,
}

impl SqliteTagStore {
    /// Wraps an opened database.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagtree::{Database, SqliteTagStore, TagStore};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let store = SqliteTagStore::new(Database::in_memory()?);
    /// assert!(store.query_root_tags_with_children()?.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    /// Runs a closure against the raw connection outside of any transaction.
    ///
    /// Useful for inspection in tests and maintenance tooling.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(db.connection())?)
    }
}

impl TagStore for SqliteTagStore {
    fn query_root_tags_with_children(&self) -> StoreResult<Vec<TagNode>> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        let rows = SqliteWriter {
            conn: db.connection(),
        }
        .query_rows("SELECT id, name, parent_id, date_created, date_updated FROM tags", [])?;
        drop(db);

        let total = rows.len();
        let mut by_parent: HashMap<Option<TagId>, Vec<TagRow>> = HashMap::new();
        for row in rows {
            by_parent.entry(row.parent_id.clone()).or_default().push(row);
        }

        let roots: Vec<TagNode> = by_parent
            .remove(&None)
            .unwrap_or_default()
            .into_iter()
            .map(|row| assemble(row, &mut by_parent))
            .collect();

        let unreachable: usize = by_parent.values().map(Vec::len).sum();
        if unreachable > 0 {
            warn!(
                unreachable,
                total, "Tag rows not reachable from any root were left out of the tree"
            );
        }

        Ok(roots)
    }

    fn transaction<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn TagWriter) -> StoreResult<T>,
    {
        let mut db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = db.connection_mut().transaction()?;

        // Dropping `tx` on the error path rolls back.
        let result = work(&SqliteWriter { conn: &tx })?;
        tx.commit()?;
        Ok(result)
    }
}

/// Nests the rows grouped under `row.id` beneath `row`, recursively.
fn assemble(row: TagRow, by_parent: &mut HashMap<Option<TagId>, Vec<TagRow>>) -> TagNode {
    let children = by_parent.remove(&Some(row.id.clone())).unwrap_or_default();
    children
        .into_iter()
        .fold(TagNode::leaf(row), |node, child| {
            node.with_child(assemble(child, by_parent))
        })
}

struct SqliteWriter<'a> {
    conn: &'a Connection,
}

impl SqliteWriter<'_> {
    fn query_rows(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<Vec<TagRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, read_raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawRow::into_row).collect()
    }
}

impl TagWriter for SqliteWriter<'_> {
    fn query_tag(&self, id: &TagId) -> StoreResult<Option<TagRow>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, name, parent_id, date_created, date_updated FROM tags WHERE id = ?1",
                [id.as_str()],
                read_raw_row,
            )
            .optional()?;
        raw.map(RawRow::into_row).transpose()
    }

    fn query_tag_children(&self, id: &TagId) -> StoreResult<Vec<TagRow>> {
        self.query_rows(
            "SELECT id, name, parent_id, date_created, date_updated FROM tags WHERE parent_id = ?1",
            [id.as_str()],
        )
    }

    fn insert_tag(&self, row: &TagRow) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO tags (id, name, parent_id, date_created, date_updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                row.id.as_str(),
                &row.name,
                row.parent_id.as_ref().map(TagId::as_str),
                to_millis(row.date_created),
                to_millis(row.date_updated),
            ),
        )?;
        Ok(())
    }

    fn update_tag(&self, row: &TagRow) -> StoreResult<usize> {
        let updated = self.conn.execute(
            "UPDATE tags SET name = ?2, parent_id = ?3, date_updated = ?4 WHERE id = ?1",
            (
                row.id.as_str(),
                &row.name,
                row.parent_id.as_ref().map(TagId::as_str),
                to_millis(row.date_updated),
            ),
        )?;
        Ok(updated)
    }

    fn delete_tag_row(&self, id: &TagId) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM tags WHERE id = ?1", [id.as_str()])?)
    }

    fn delete_entry_associations(&self, tag_id: &TagId) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM entry_tags WHERE tag_id = ?1", [tag_id.as_str()])?)
    }

    fn attach_entry(&self, entry_id: &EntryId, tag_id: &TagId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "INSERT OR IGNORE INTO entry_tags (entry_id, tag_id) VALUES (?1, ?2)",
            [entry_id.as_str(), tag_id.as_str()],
        )?)
    }

    fn entry_tag_ids(&self, entry_id: &EntryId) -> StoreResult<Vec<TagId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag_id FROM entry_tags WHERE entry_id = ?1 ORDER BY tag_id")?;
        let ids = stmt
            .query_map([entry_id.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(TagId::new).collect())
    }
}

/// A tag row as read from SQLite, before timestamp conversion.
struct RawRow {
    id: String,
    name: String,
    parent_id: Option<String>,
    date_created: i64,
    date_updated: i64,
}

impl RawRow {
    fn into_row(self) -> StoreResult<TagRow> {
        Ok(TagRow {
            id: TagId::new(self.id),
            name: self.name,
            parent_id: self.parent_id.map(TagId::new),
            date_created: from_millis(self.date_created)?,
            date_updated: from_millis(self.date_updated)?,
        })
    }
}

fn read_raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        date_created: row.get(3)?,
        date_updated: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::delete_tag_tree;
    use time::macros::datetime;

    fn row(id: &str, parent: Option<&str>) -> TagRow {
        TagRow {
            id: TagId::new(id),
            name: format!("name-{id}"),
            parent_id: parent.map(TagId::new),
            date_created: datetime!(2024-05-01 10:00:00.123 UTC),
            date_updated: datetime!(2024-05-01 10:00:00.456 UTC),
        }
    }

    fn store_with(rows: &[TagRow]) -> SqliteTagStore {
        let store = SqliteTagStore::new(Database::in_memory().expect("in-memory database"));
        store
            .transaction(|w| {
                for r in rows {
                    w.insert_tag(r)?;
                }
                Ok(())
            })
            .expect("seed rows");
        store
    }

    fn count(store: &SqliteTagStore, sql: &str) -> i64 {
        store
            .with_connection(|conn| conn.query_row(sql, [], |r| r.get(0)))
            .expect("count query")
    }

    #[test]
    fn query_root_tags_nests_children() {
        let store = store_with(&[
            row("a", None),
            row("b", Some("a")),
            row("c", Some("b")),
            row("d", None),
        ]);

        let mut roots = store.query_root_tags_with_children().unwrap();
        roots.sort_by(|x, y| x.row.id.cmp(&y.row.id));

        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].row.id, TagId::new("a"));
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].row.id, TagId::new("b"));
        assert_eq!(roots[0].children[0].children[0].row.id, TagId::new("c"));
        assert!(roots[1].children.is_empty());
    }

    #[test]
    fn timestamps_round_trip_with_millisecond_precision() {
        let store = store_with(&[row("a", None)]);

        let loaded = store
            .transaction(|w| w.query_tag(&TagId::new("a")))
            .unwrap()
            .expect("row should exist");

        assert_eq!(loaded, row("a", None));
    }

    #[test]
    fn failed_work_rolls_back() {
        let store = store_with(&[]);

        let result: StoreResult<()> = store.transaction(|w| {
            w.insert_tag(&row("a", None))?;
            // Dangling parent violates the foreign key.
            w.insert_tag(&row("b", Some("ghost")))
        });

        assert!(result.is_err());
        assert_eq!(count(&store, "SELECT COUNT(*) FROM tags"), 0);
    }

    #[test]
    fn update_reports_affected_rows() {
        let store = store_with(&[row("a", None), row("b", None)]);

        let mut moved = row("b", Some("a"));
        moved.name = "renamed".to_string();
        let updated = store.transaction(|w| w.update_tag(&moved)).unwrap();
        let missing = store
            .transaction(|w| w.update_tag(&row("zzz", None)))
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(missing, 0);
        let children = store
            .transaction(|w| w.query_tag_children(&TagId::new("a")))
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "renamed");
    }

    #[test]
    fn delete_tag_tree_removes_rows_and_associations() {
        let store = store_with(&[
            row("a", None),
            row("b", Some("a")),
            row("c", Some("b")),
            row("d", None),
        ]);
        store
            .transaction(|w| {
                w.attach_entry(&EntryId::new("e1"), &TagId::new("c"))?;
                w.attach_entry(&EntryId::new("e1"), &TagId::new("d"))?;
                w.attach_entry(&EntryId::new("e2"), &TagId::new("a"))?;
                Ok(())
            })
            .unwrap();

        let removed = store
            .transaction(|w| delete_tag_tree(w, &TagId::new("a")))
            .unwrap();

        assert_eq!(removed, 3);
        assert_eq!(count(&store, "SELECT COUNT(*) FROM tags"), 1);
        let remaining = store
            .transaction(|w| w.entry_tag_ids(&EntryId::new("e1")))
            .unwrap();
        assert_eq!(remaining, vec![TagId::new("d")]);
        assert_eq!(
            count(&store, "SELECT COUNT(*) FROM entry_tags WHERE entry_id = 'e2'"),
            0
        );
    }

    #[test]
    fn attach_entry_is_idempotent() {
        let store = store_with(&[row("a", None)]);

        let first = store
            .transaction(|w| w.attach_entry(&EntryId::new("e"), &TagId::new("a")))
            .unwrap();
        let second = store
            .transaction(|w| w.attach_entry(&EntryId::new("e"), &TagId::new("a")))
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
