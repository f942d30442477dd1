use serde::{Deserialize, Serialize};

use super::TagId;

/// Input for creating or updating a tag.
///
/// `id` absent means "create": [`TagService::update_tag`](crate::TagService::update_tag)
/// treats a `NewTag` without an id as an insert. `parent_id` absent means the
/// tag is (or becomes) a root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTag {
    #[serde(default)]
    pub id: Option<TagId>,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<TagId>,
}

impl NewTag {
    /// A new root tag with the given name.
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            parent_id: None,
        }
    }

    /// A new tag under `parent`.
    pub fn child(name: impl Into<String>, parent: TagId) -> Self {
        Self {
            id: None,
            name: name.into(),
            parent_id: Some(parent),
        }
    }

    /// Targets an existing tag, turning the request into an update.
    pub fn with_id(mut self, id: TagId) -> Self {
        self.id = Some(id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_without_optional_fields() {
        let new: NewTag = serde_json::from_str(r#"{"name":"rust"}"#).unwrap();
        assert_eq!(new, NewTag::root("rust"));
    }

    #[test]
    fn with_id_sets_target() {
        let new = NewTag::child("x", TagId::new("p")).with_id(TagId::new("t"));
        assert_eq!(new.id, Some(TagId::new("t")));
        assert_eq!(new.parent_id, Some(TagId::new("p")));
    }
}
