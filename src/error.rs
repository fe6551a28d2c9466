//! Error types for the AddressBase Premium pipeline.
//!
//! Each stage of a run has its own error type so callers can decide what is
//! fatal: an [`ExtractError`] only loses one archive, while a [`SplitError`]
//! or [`LoadError`] ends the run.

use std::path::PathBuf;
use thiserror::Error;

/// Problems with the static configuration (headers, table map, identifiers).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No header configured for record type {type_code} (mapped to table {table})")]
    MissingHeader { type_code: String, table: String },

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Failed to read header file {}: {source}", path.display())]
    HeaderFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure to extract one archive.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Failed to open archive {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Failed to extract {entry} from {}: {source}", archive.display())]
    Entry {
        archive: PathBuf,
        entry: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while classifying records into per-type files.
#[derive(Error, Debug)]
pub enum SplitError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown record type {type_code:?} at {}:{line}", path.display())]
    UnknownType {
        type_code: String,
        path: PathBuf,
        line: u64,
    },

    #[error("Failed to write type file {}: {source}", path.display())]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure while importing per-type files into the database.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Database error during {stage}: {source}")]
    Database {
        stage: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("COPY into {table} stalled: channel still busy after {attempts} attempts")]
    Backpressure { table: String, attempts: u32 },

    #[error("COPY channel for {table} closed before all data was sent")]
    ChannelClosed { table: String },

    #[error("Not connected to the target database (stage: {0})")]
    NotConnected(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoadError {
    /// Wraps a sqlx error with the stage it happened in.
    pub fn database(stage: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            stage: stage.into(),
            source,
        }
    }
}

/// Top level error for a processing run.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to remove extracted file {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
