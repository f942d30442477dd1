pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod service;
pub mod store;
pub mod utils;

pub use cache::TagCache;
pub use config::Config;
pub use db::Database;
pub use error::{StoreError, TagError, TagResult};
pub use models::{EntryId, NewTag, Tag, TagId, TagNode, TagRow};
pub use service::{DriftReport, TagService};
pub use store::{SqliteTagStore, TagStore, TagWriter};
