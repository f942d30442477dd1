mod schema;

use std::path::Path;

use rusqlite::Connection;

use crate::error::StoreResult;
use schema::INITIAL_SCHEMA;

/// Database wrapper providing connection management and schema initialization.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens an in-memory SQLite database.
    ///
    /// Automatically initializes the schema on connection open.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Opens a file-based SQLite database at the given path.
    ///
    /// Creates the database file if it does not exist.
    /// Automatically initializes the schema on connection open.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// Uses IF NOT EXISTS for idempotent execution.
    fn initialize_schema(&self) -> StoreResult<()> {
        self.conn.execute("PRAGMA foreign_keys = ON", [])?;
        self.conn.execute_batch(INITIAL_SCHEMA)?;
        Ok(())
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Returns a mutable reference to the underlying connection.
    ///
    /// Needed to open rusqlite transactions.
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn schema_tables_exist() {
        let db = Database::in_memory().unwrap();

        let tables: Vec<String> = db
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"tags".to_string()));
        assert!(tables.contains(&"entry_tags".to_string()));
    }

    #[test]
    fn schema_indexes_exist() {
        let db = Database::in_memory().unwrap();

        let indexes: Vec<String> = db
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(indexes.contains(&"idx_tags_parent".to_string()));
        assert!(indexes.contains(&"idx_entry_tags_tag".to_string()));
    }

    #[test]
    fn foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();

        let fk_enabled: i32 = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();

        assert_eq!(fk_enabled, 1);
    }

    #[test]
    fn parent_must_exist() {
        let db = Database::in_memory().unwrap();

        let result = db.connection().execute(
            "INSERT INTO tags (id, name, parent_id, date_created, date_updated)
             VALUES ('child', 'child', 'ghost', 0, 0)",
            [],
        );

        assert!(result.is_err(), "foreign key on parent_id should reject dangling parent");
    }

    #[test]
    fn deleting_tag_cascades_to_entry_associations() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection();

        conn.execute_batch(
            "INSERT INTO tags (id, name, date_created, date_updated) VALUES ('t1', 'rust', 0, 0);
             INSERT INTO entry_tags (entry_id, tag_id) VALUES ('e1', 't1'), ('e2', 't1');
             DELETE FROM tags WHERE id = 't1';",
        )
        .unwrap();

        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM entry_tags", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn hierarchy_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("tags.db");
        std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();

        {
            let db = Database::open(&db_path).unwrap();
            db.connection()
                .execute_batch(
                    "INSERT INTO tags (id, name, parent_id, date_created, date_updated)
                     VALUES ('lang', 'languages', NULL, 0, 0), ('rust', 'rust', 'lang', 5, 7);",
                )
                .unwrap();
        }
        assert!(db_path.exists());

        // Schema setup runs again on an existing file.
        let db = Database::open(&db_path).unwrap();
        let (parent, created, updated): (Option<String>, i64, i64) = db
            .connection()
            .query_row(
                "SELECT parent_id, date_created, date_updated FROM tags WHERE id = 'rust'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(parent.as_deref(), Some("lang"));
        assert_eq!((created, updated), (5, 7));

        // Foreign keys are enforced on the reopened connection too.
        let orphaning = db
            .connection()
            .execute("DELETE FROM tags WHERE id = 'lang'", []);
        assert!(orphaning.is_err(), "parent with children should not be deletable");
    }
}
