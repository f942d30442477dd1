//! Error types for the tag hierarchy.

use thiserror::Error;

use crate::TagId;

/// Failures raised by a [`TagStore`](crate::TagStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid stored timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),

    #[error("Store connection lock poisoned")]
    Poisoned,
}

/// Errors returned by the tag cache and [`TagService`](crate::TagService).
#[derive(Error, Debug)]
pub enum TagError {
    #[error("Tag not found: {0}")]
    NotFound(TagId),

    #[error("Unknown parent tag: {0}")]
    InvalidParent(TagId),

    #[error("Tag {id} cannot be moved under {parent}: parent is inside its own subtree")]
    CyclicParent { id: TagId, parent: TagId },

    #[error("Tag already exists: {0}")]
    AlreadyExists(TagId),

    #[error("Tag name cannot be empty")]
    EmptyName,

    #[error("Tag name '{0}' cannot contain '/' when a parent is given")]
    PathWithParent(String),

    #[error("Parent path '{0}' could not be found")]
    UnknownParentPath(String),

    #[error("Tag cache lock poisoned; rebuild required")]
    CachePoisoned,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TagError {
    /// True for an unknown tag id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TagError::NotFound(_))
    }

    /// True for rejected input that never reached the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TagError::InvalidParent(_)
                | TagError::CyclicParent { .. }
                | TagError::AlreadyExists(_)
                | TagError::EmptyName
                | TagError::PathWithParent(_)
                | TagError::UnknownParentPath(_)
        )
    }
}

pub type TagResult<T> = Result<T, TagError>;
pub type StoreResult<T> = Result<T, StoreError>;
