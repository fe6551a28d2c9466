//! Bulk loading of per-type files into PostgreSQL.
//!
//! The [`PostgresLoader`] follows a fixed sequence for every import:
//! 1. Drop and recreate the target database, so reruns never append to stale data
//! 2. Run the schema script verbatim
//! 3. `COPY` every mapped `t<code>.csv.gz` into its table
//! 4. Build that table's indexes once its copy has completed
//!
//! Database access goes through the [`TargetStore`] trait; [`PgStore`] is the
//! sqlx implementation.
//!
//! # Example
//!
//! ```no_run
//! use abp_process::config::DatabaseSettings;
//! use abp_process::loader::{Loader, PgStore, PostgresLoader};
//! use abp_process::tables::TableMap;
//! use std::path::Path;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = DatabaseSettings::new("postgres://localhost/postgres");
//! let store = PgStore::new(settings.connect_options()?, settings.maintenance_database());
//! let schema = std::fs::read_to_string("resources/pg-scripts/PostgreSQL_AddressBase_Premium_CreateTable.sql")?;
//!
//! let mut loader = PostgresLoader::new(store, TableMap::address_base(), schema);
//! let summary = loader.load(Path::new("types"), "abp").await?;
//! println!("{} tables loaded", summary.tables.len());
//! # Ok(())
//! # }
//! ```

use crate::copy::{BackpressurePolicy, CopyProgress, CopySink, pump_gzip_file};
use crate::error::LoadError;
use crate::tables::{TableMap, validate_identifier};
use crate::utilities::{format_count, format_elapsed};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgCopyIn};
use sqlx::{Connection, Executor, PgConnection};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Chunks buffered between the file reader and the COPY stream.
const COPY_QUEUE_DEPTH: usize = 16;

/// Loads a directory of per-type files into a named database.
#[async_trait]
pub trait Loader: Send {
    async fn load(&mut self, dir: &Path, database: &str) -> Result<ImportSummary, LoadError>;
}

/// Outcome of one table's `COPY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    /// Rows the server reported as copied
    pub rows: u64,
    pub progress: CopyProgress,
}

/// The database operations the loader needs.
#[async_trait]
pub trait TargetStore: Send {
    /// Drops `name` if it exists, creates it, and makes it the current database.
    async fn recreate_database(&mut self, name: &str) -> Result<(), LoadError>;

    /// Executes a DDL script as-is.
    async fn apply_schema(&mut self, ddl: &str) -> Result<(), LoadError>;

    /// Streams a gzip CSV file (with header row) into `table`.
    async fn copy_file(
        &mut self,
        table: &str,
        path: &Path,
        policy: &BackpressurePolicy,
    ) -> Result<CopyReport, LoadError>;

    async fn create_index(&mut self, index: &str, table: &str, column: &str) -> Result<(), LoadError>;
}

/// One table loaded by an import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableImport {
    pub table: String,
    pub file: PathBuf,
    pub rows: u64,
    pub copy_elapsed: Duration,
    pub indexes: Vec<String>,
}

/// Everything an import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub tables: Vec<TableImport>,
    /// Type files with no table mapping
    pub skipped: Vec<PathBuf>,
}

impl ImportSummary {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Recreates the target database and bulk loads every mapped type file.
#[derive(Debug)]
pub struct PostgresLoader<S> {
    store: S,
    tables: TableMap,
    schema: String,
    policy: BackpressurePolicy,
}

impl<S: TargetStore> PostgresLoader<S> {
    pub fn new(store: S, tables: TableMap, schema: impl Into<String>) -> Self {
        Self {
            store,
            tables,
            schema: schema.into(),
            policy: BackpressurePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tables(&self) -> &TableMap {
        &self.tables
    }

    /// Copies every mapped type file in `dir` and indexes its table.
    ///
    /// Files are handled in name order. Unmapped `t<code>.csv.gz` files and
    /// anything else in the directory are skipped.
    pub async fn import_files(&mut self, dir: &Path) -> Result<ImportSummary, LoadError> {
        let entries = fs::read_dir(dir).map_err(|source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LoadError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            if entry.path().is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut summary = ImportSummary::default();

        for path in files {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".csv.gz") {
                continue;
            }

            let Some(mapping) = self.tables.for_file_name(file_name).copied() else {
                debug!(path = %path.display(), "No table mapped for type file, skipping");
                summary.skipped.push(path);
                continue;
            };

            info!(path = %path.display(), table = mapping.table, "Processing type file");
            let start = Instant::now();
            let report = self.store.copy_file(mapping.table, &path, &self.policy).await?;
            let copy_elapsed = start.elapsed();
            info!(
                table = mapping.table,
                rows = report.rows,
                lines = report.progress.lines,
                "Loaded {} records in {}",
                format_count(report.rows as usize),
                format_elapsed(copy_elapsed)
            );

            let mut indexes = Vec::with_capacity(mapping.indexes.len());
            for column in mapping.indexes {
                let index = mapping.index_name(column);
                info!("Creating index {index} ON {} ({column})", mapping.table);
                let start = Instant::now();
                self.store.create_index(&index, mapping.table, column).await?;
                info!(index = %index, "Index created in {}", format_elapsed(start.elapsed()));
                indexes.push(index);
            }

            summary.tables.push(TableImport {
                table: mapping.table.to_string(),
                file: path,
                rows: report.rows,
                copy_elapsed,
                indexes,
            });
        }

        Ok(summary)
    }
}

#[async_trait]
impl<S: TargetStore> Loader for PostgresLoader<S> {
    async fn load(&mut self, dir: &Path, database: &str) -> Result<ImportSummary, LoadError> {
        validate_identifier(database)?;

        info!(database, "Recreating database");
        self.store.recreate_database(database).await?;

        info!(database, "Importing schema");
        self.store.apply_schema(&self.schema).await?;

        let start = Instant::now();
        let summary = self.import_files(dir).await?;
        info!(
            database,
            tables = summary.tables.len(),
            skipped = summary.skipped.len(),
            rows = summary.total_rows(),
            "Import finished in {}",
            format_elapsed(start.elapsed())
        );

        Ok(summary)
    }
}

/// [`TargetStore`] over a single sqlx PostgreSQL connection.
#[derive(Debug)]
pub struct PgStore {
    options: PgConnectOptions,
    maintenance_database: String,
    conn: Option<PgConnection>,
}

impl PgStore {
    /// `options` locate the server; `maintenance_database` is where
    /// `DROP/CREATE DATABASE` run (usually `postgres`).
    pub fn new(options: PgConnectOptions, maintenance_database: impl Into<String>) -> Self {
        Self {
            options,
            maintenance_database: maintenance_database.into(),
            conn: None,
        }
    }

    fn connection(&mut self, stage: &str) -> Result<&mut PgConnection, LoadError> {
        self.conn
            .as_mut()
            .ok_or_else(|| LoadError::NotConnected(stage.to_string()))
    }
}

#[async_trait]
impl TargetStore for PgStore {
    async fn recreate_database(&mut self, name: &str) -> Result<(), LoadError> {
        validate_identifier(name)?;

        if let Some(conn) = self.conn.take() {
            conn.close()
                .await
                .map_err(|e| LoadError::database("closing previous connection", e))?;
        }

        let admin_options = self.options.clone().database(&self.maintenance_database);
        let mut admin = PgConnection::connect_with(&admin_options)
            .await
            .map_err(|e| LoadError::database(format!("connecting to {}", self.maintenance_database), e))?;

        let drop_sql = format!("DROP DATABASE IF EXISTS {name}");
        Executor::execute(&mut admin, sqlx::raw_sql(&drop_sql))
            .await
            .map_err(|e| LoadError::database(format!("dropping database {name}"), e))?;

        let create_sql = format!("CREATE DATABASE {name}");
        Executor::execute(&mut admin, sqlx::raw_sql(&create_sql))
            .await
            .map_err(|e| LoadError::database(format!("creating database {name}"), e))?;

        admin
            .close()
            .await
            .map_err(|e| LoadError::database("closing maintenance connection", e))?;

        let target_options = self.options.clone().database(name);
        let conn = PgConnection::connect_with(&target_options)
            .await
            .map_err(|e| LoadError::database(format!("connecting to {name}"), e))?;
        self.conn = Some(conn);

        Ok(())
    }

    async fn apply_schema(&mut self, ddl: &str) -> Result<(), LoadError> {
        let conn = self.connection("schema import")?;
        Executor::execute(conn, sqlx::raw_sql(ddl))
            .await
            .map_err(|e| LoadError::database("schema import", e))?;
        Ok(())
    }

    async fn copy_file(
        &mut self,
        table: &str,
        path: &Path,
        policy: &BackpressurePolicy,
    ) -> Result<CopyReport, LoadError> {
        validate_identifier(table)?;
        let stage = format!("COPY {table}");
        let conn = self.connection(&stage)?;

        let statement = format!("COPY {table} FROM STDIN WITH CSV HEADER");
        let copy_in = conn
            .copy_in_raw(&statement)
            .await
            .map_err(|e| LoadError::database(stage.as_str(), e))?;

        let sink = PgCopySink { copy_in, stage };
        let (progress, rows) = pump_gzip_file(path, table, sink, policy, COPY_QUEUE_DEPTH).await?;
        info!(table, rows, "Result of COPY is: PGRES_COMMAND_OK");

        Ok(CopyReport { rows, progress })
    }

    async fn create_index(&mut self, index: &str, table: &str, column: &str) -> Result<(), LoadError> {
        for name in [index, table, column] {
            validate_identifier(name)?;
        }

        let stage = format!("creating index {index}");
        let conn = self.connection(&stage)?;
        let sql = format!("CREATE INDEX {index} ON {table} ({column})");
        Executor::execute(conn, sqlx::raw_sql(&sql))
            .await
            .map_err(|e| LoadError::database(stage, e))?;
        Ok(())
    }
}

/// A running `COPY ... FROM STDIN` on a [`PgStore`] connection.
struct PgCopySink<'c> {
    copy_in: PgCopyIn<&'c mut PgConnection>,
    stage: String,
}

#[async_trait]
impl CopySink for PgCopySink<'_> {
    type Output = u64;

    async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<(), LoadError> {
        self.copy_in
            .send(chunk)
            .await
            .map_err(|e| LoadError::database(self.stage.as_str(), e))?;
        Ok(())
    }

    /// Returns the number of rows the server copied.
    async fn finish(self) -> Result<u64, LoadError> {
        let stage = self.stage;
        self.copy_in
            .finish()
            .await
            .map_err(|e| LoadError::database(stage, e))
    }
}
