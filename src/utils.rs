//! Shared helpers for ids, timestamps and database paths.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use time::{Duration, OffsetDateTime};

use crate::TagId;

/// Generates a fresh tag id.
///
/// Nine random bytes encoded as URL-safe base64 without padding, giving a
/// 12 character id that is safe in URLs and file names.
pub fn generate_tag_id() -> TagId {
    let bytes: [u8; 9] = rand::random();
    TagId::new(URL_SAFE_NO_PAD.encode(bytes))
}

/// Returns the current UTC time truncated to whole milliseconds.
///
/// Stored timestamps have millisecond precision, so truncating up front keeps
/// cached values equal to what a reload from the store would produce.
pub fn now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond() % 1_000_000))
}

/// Converts a timestamp to unix milliseconds.
pub fn to_millis(time: OffsetDateTime) -> i64 {
    (time.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Converts unix milliseconds back to a UTC timestamp.
pub fn from_millis(millis: i64) -> Result<OffsetDateTime, time::error::ComponentRange> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
}

/// Gets the cross-platform database path.
///
/// Returns the path as `{data_dir}/tagtree/tags.db` where `data_dir` is:
/// - Linux: `~/.local/share`
/// - macOS: `~/Library/Application Support`
/// - Windows: `C:\Users\<user>\AppData\Roaming`
///
/// # Errors
///
/// Returns an error if the data directory cannot be determined.
pub fn get_database_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Failed to determine data directory"))?;

    Ok(data_dir.join("tagtree").join("tags.db"))
}

/// Ensures the parent directory of the database file exists.
///
/// # Errors
///
/// Returns an error if directory creation fails.
pub fn ensure_database_directory(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_ids_are_url_safe_and_twelve_chars() {
        let id = generate_tag_id();

        assert_eq!(id.as_str().len(), 12);
        assert!(
            id.as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_tag_id(), generate_tag_id());
    }

    #[test]
    fn now_survives_millisecond_round_trip() {
        let time = now();
        let restored = from_millis(to_millis(time)).unwrap();

        assert_eq!(restored, time);
    }

    #[test]
    fn ensure_database_directory_creates_parents() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("deeper").join("tags.db");

        ensure_database_directory(&db_path).unwrap();

        assert!(db_path.parent().unwrap().exists());
    }

    #[test]
    fn database_path_ends_with_app_dir() {
        if let Ok(path) = get_database_path() {
            assert!(path.ends_with("tagtree/tags.db"));
        }
    }
}
