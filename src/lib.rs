//! AddressBase Premium Processing Library
//!
//! This library extracts AddressBase Premium CSV archives, splits their
//! records into one gzip-compressed file per record type, and bulk loads
//! those files into PostgreSQL.

pub mod config;
pub mod copy;
pub mod error;
pub mod headers;
pub mod loader;
pub mod logging;
pub mod processor;
pub mod registry;
pub mod splitter;
pub mod tables;
pub mod unzip;
pub mod utilities;

pub use config::{DatabaseSettings, DirLayout, RunOptions};
pub use error::{ConfigError, ExtractError, LoadError, ProcessError, SplitError};
pub use headers::{HeaderCatalog, TypeCode};
pub use loader::{ImportSummary, Loader, PgStore, PostgresLoader, TargetStore};
pub use processor::{ProcessSummary, Processor, RunSummary};
pub use tables::{TableMap, TableMapping};
