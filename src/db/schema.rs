/// Complete database schema for tag storage.
///
/// Uses CREATE TABLE/INDEX IF NOT EXISTS for idempotent execution.
/// Timestamps are unix milliseconds.
pub const INITIAL_SCHEMA: &str = r#"
-- Tags table: one row per tag, parent_id NULL for roots
CREATE TABLE IF NOT EXISTS tags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    parent_id TEXT REFERENCES tags(id),
    date_created INTEGER NOT NULL,
    date_updated INTEGER NOT NULL
);

-- Junction table: links content entries to tags (many-to-many)
CREATE TABLE IF NOT EXISTS entry_tags (
    entry_id TEXT NOT NULL,
    tag_id TEXT NOT NULL,
    PRIMARY KEY (entry_id, tag_id),
    FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
);

-- Index for child lookups during cascading deletes
CREATE INDEX IF NOT EXISTS idx_tags_parent ON tags(parent_id);

-- Index for removing associations by tag
CREATE INDEX IF NOT EXISTS idx_entry_tags_tag ON entry_tags(tag_id);
"#;
