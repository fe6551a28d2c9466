//! Run configuration: modes, working directories and database connection.

use crate::error::{ConfigError, LoadError};
use sqlx::postgres::PgConnectOptions;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Database used for `DROP/CREATE DATABASE` when none is configured.
pub const DEFAULT_MAINTENANCE_DATABASE: &str = "postgres";

/// Flags that change what a run does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Delete extracted CSV files once they have been split
    pub remove_extracted: bool,
    /// Stop after writing the type files; no database import
    pub compressed_only: bool,
    /// Skip extraction and splitting; import existing type files
    pub import_only: bool,
    /// Abort the batch on the first archive that fails to extract
    pub stop_on_archive_error: bool,
}

/// Where extracted CSVs and per-type files are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirLayout {
    pub unpacked: PathBuf,
    pub types: PathBuf,
}

impl DirLayout {
    /// `unpacked/` and `types/` under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            unpacked: root.join("unpacked"),
            types: root.join("types"),
        }
    }

    /// Creates both directories if they are missing.
    pub fn ensure(&self) -> Result<(), ConfigError> {
        for dir in [&self.unpacked, &self.types] {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Directory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// How to reach the PostgreSQL server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    url: String,
    maintenance_database: String,
}

impl DatabaseSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            maintenance_database: DEFAULT_MAINTENANCE_DATABASE.to_string(),
        }
    }

    #[must_use]
    pub fn with_maintenance_database(mut self, name: impl Into<String>) -> Self {
        self.maintenance_database = name.into();
        self
    }

    pub fn maintenance_database(&self) -> &str {
        &self.maintenance_database
    }

    /// Parses the connection URL. The database in the URL is replaced per
    /// connection, so any value there is ignored.
    pub fn connect_options(&self) -> Result<PgConnectOptions, LoadError> {
        PgConnectOptions::from_str(&self.url).map_err(|e| LoadError::database("parsing database URL", e))
    }
}
