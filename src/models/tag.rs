use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::TagId;

/// A named node in the tag hierarchy.
///
/// Tags form a forest: each tag has at most one parent and any number of
/// children. Children are held by id, never by value, so a `Tag` handed out by
/// the service is a detached copy that later cache mutations cannot touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    id: TagId,
    name: String,
    parent_id: Option<TagId>,
    children: BTreeSet<TagId>,
    #[serde(with = "time::serde::rfc3339")]
    date_created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    date_updated: OffsetDateTime,
}

impl Tag {
    /// Creates a childless tag from a persisted row.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagtree::{Tag, TagId, TagRow};
    /// use time::macros::datetime;
    ///
    /// let row = TagRow {
    ///     id: TagId::new("t1"),
    ///     name: "rust".to_string(),
    ///     parent_id: None,
    ///     date_created: datetime!(2024-01-01 0:00 UTC),
    ///     date_updated: datetime!(2024-01-01 0:00 UTC),
    /// };
    /// let tag = Tag::from_row(row);
    /// assert_eq!(tag.name(), "rust");
    /// assert!(tag.is_root());
    /// assert!(tag.children().is_empty());
    /// ```
    pub fn from_row(row: TagRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            parent_id: row.parent_id,
            children: BTreeSet::new(),
            date_created: row.date_created,
            date_updated: row.date_updated,
        }
    }

    /// Returns the tag's unique identifier.
    pub fn id(&self) -> &TagId {
        &self.id
    }

    /// Returns the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the parent id, or `None` for a root tag.
    pub fn parent_id(&self) -> Option<&TagId> {
        self.parent_id.as_ref()
    }

    /// Returns the ids of the direct children, in id order.
    pub fn children(&self) -> &BTreeSet<TagId> {
        &self.children
    }

    pub fn date_created(&self) -> OffsetDateTime {
        self.date_created
    }

    pub fn date_updated(&self) -> OffsetDateTime {
        self.date_updated
    }

    /// Returns true when the tag has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub(crate) fn set_parent(&mut self, parent_id: Option<TagId>) {
        self.parent_id = parent_id;
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeSet<TagId> {
        &mut self.children
    }

    /// Overwrites the name and timestamps from a fresher row.
    ///
    /// Identity, parent and children are left alone; those are structural and
    /// belong to the cache.
    pub(crate) fn refresh_from(&mut self, row: &TagRow) {
        self.name.clone_from(&row.name);
        self.date_created = row.date_created;
        self.date_updated = row.date_updated;
    }
}

/// A tag row as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRow {
    pub id: TagId,
    pub name: String,
    pub parent_id: Option<TagId>,
    pub date_created: OffsetDateTime,
    pub date_updated: OffsetDateTime,
}

/// A row together with its nested children, as loaded for a cache build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagNode {
    pub row: TagRow,
    pub children: Vec<TagNode>,
}

impl TagNode {
    /// Creates a node with no children.
    pub(crate) fn leaf(row: TagRow) -> Self {
        Self {
            row,
            children: Vec::new(),
        }
    }

    /// Appends a child node.
    pub(crate) fn with_child(mut self, child: TagNode) -> Self {
        self.children.push(child);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn row(id: &str, parent: Option<&str>) -> TagRow {
        TagRow {
            id: TagId::new(id),
            name: format!("name-{id}"),
            parent_id: parent.map(TagId::new),
            date_created: datetime!(2024-03-01 12:00 UTC),
            date_updated: datetime!(2024-03-01 12:00 UTC),
        }
    }

    #[test]
    fn from_row_copies_attributes() {
        let tag = Tag::from_row(row("t2", Some("t1")));

        assert_eq!(tag.id(), &TagId::new("t2"));
        assert_eq!(tag.name(), "name-t2");
        assert_eq!(tag.parent_id(), Some(&TagId::new("t1")));
        assert!(!tag.is_root());
        assert!(tag.children().is_empty());
    }

    #[test]
    fn refresh_from_keeps_structure() {
        let mut tag = Tag::from_row(row("t2", Some("t1")));
        tag.children_mut().insert(TagId::new("t3"));

        let mut newer = row("t2", None);
        newer.name = "renamed".to_string();
        newer.date_created = datetime!(2024-03-02 11:00 UTC);
        newer.date_updated = datetime!(2024-03-02 12:00 UTC);
        tag.refresh_from(&newer);

        assert_eq!(tag.name(), "renamed");
        assert_eq!(tag.date_created(), datetime!(2024-03-02 11:00 UTC));
        assert_eq!(tag.date_updated(), datetime!(2024-03-02 12:00 UTC));
        assert_eq!(tag.parent_id(), Some(&TagId::new("t1")));
        assert_eq!(tag.children().len(), 1);
    }

    #[test]
    fn tag_serializes_children_as_id_list() {
        let mut tag = Tag::from_row(row("t1", None));
        tag.children_mut().insert(TagId::new("t3"));
        tag.children_mut().insert(TagId::new("t2"));

        let json = serde_json::to_value(&tag).unwrap();
        assert_eq!(json["children"], serde_json::json!(["t2", "t3"]));
        assert_eq!(json["parent_id"], serde_json::Value::Null);
    }
}
