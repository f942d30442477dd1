//! Runtime configuration.
//!
//! Values come from the environment (optionally seeded from a `.env` file),
//! falling back to platform defaults.

use std::path::PathBuf;

use anyhow::Result;

use crate::utils::get_database_path;

/// Environment variable naming the database file.
pub const DB_ENV: &str = "TAGTREE_DB";

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "TAGTREE_LOG";

const DEFAULT_LOG_FILTER: &str = "warn";

/// Settings for the `tagtree` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or `tagtree=debug`.
    pub log_filter: String,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no database path is configured and the platform
    /// data directory cannot be determined.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    ///
    /// Blank values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_path = match non_blank(DB_ENV) {
            Some(path) => PathBuf::from(path),
            None => get_database_path()?,
        };
        let log_filter = non_blank(LOG_ENV).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Ok(Self {
            database_path,
            log_filter,
        })
    }

    /// Overrides the database path when one is given.
    pub fn with_database_path(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.database_path = path;
        }
        self
    }
}
