//! Persistence boundary for tags.
//!
//! [`TagStore`] is everything the service needs from durable storage: a bulk
//! load of the whole forest for cache builds, and transactional access to
//! individual rows through [`TagWriter`]. [`SqliteTagStore`] is the default
//! implementation.

mod sqlite;

pub use sqlite::SqliteTagStore;

use crate::error::StoreResult;
use crate::{EntryId, TagId, TagNode, TagRow};

/// Durable storage for tag rows and entry associations.
pub trait TagStore: Send + Sync {
    /// Loads every tag, nested under its parent, returning the roots.
    fn query_root_tags_with_children(&self) -> StoreResult<Vec<TagNode>>;

    /// Runs `work` inside one transaction.
    ///
    /// Commits when `work` returns `Ok`, rolls back when it returns `Err` or
    /// when the commit itself fails.
    fn transaction<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn TagWriter) -> StoreResult<T>;
}

/// Row-level operations available inside a transaction.
pub trait TagWriter {
    fn query_tag(&self, id: &TagId) -> StoreResult<Option<TagRow>>;

    /// Direct children of `id`.
    fn query_tag_children(&self, id: &TagId) -> StoreResult<Vec<TagRow>>;

    fn insert_tag(&self, row: &TagRow) -> StoreResult<()>;

    /// Writes name, parent and update time. Returns the number of rows affected.
    fn update_tag(&self, row: &TagRow) -> StoreResult<usize>;

    fn delete_tag_row(&self, id: &TagId) -> StoreResult<usize>;

    /// Removes every entry association pointing at `tag_id`.
    fn delete_entry_associations(&self, tag_id: &TagId) -> StoreResult<usize>;

    /// Associates an entry with a tag. Existing associations are left alone.
    fn attach_entry(&self, entry_id: &EntryId, tag_id: &TagId) -> StoreResult<usize>;

    fn entry_tag_ids(&self, entry_id: &EntryId) -> StoreResult<Vec<TagId>>;
}

/// Deletes `id` and all rows below it, children first, together with their
/// entry associations. Returns the number of tag rows removed.
pub fn delete_tag_tree(writer: &dyn TagWriter, id: &TagId) -> StoreResult<usize> {
    let mut removed = 0;
    for child in writer.query_tag_children(id)? {
        removed += delete_tag_tree(writer, &child.id)?;
    }
    writer.delete_entry_associations(id)?;
    removed += writer.delete_tag_row(id)?;
    Ok(removed)
}
