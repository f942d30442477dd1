mod ids;
mod new_tag;
mod tag;

pub use ids::{EntryId, TagId};
pub use new_tag::NewTag;
pub use tag::{Tag, TagNode, TagRow};
