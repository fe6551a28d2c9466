//! AddressBase Premium Processing CLI Application
//!
//! Splits AddressBase Premium archives into per-record-type files and loads
//! them into a freshly created PostgreSQL database.

use abp_process::{
    config::{DEFAULT_MAINTENANCE_DATABASE, DatabaseSettings, DirLayout, RunOptions},
    headers::HeaderCatalog,
    loader::{PgStore, PostgresLoader},
    logging::{LogLevel, init_logging},
    processor::{Processor, RunSummary},
    tables::TableMap,
    unzip::find_archives,
    utilities::{format_count, format_elapsed},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// AddressBase Premium processor
///
/// Extract AddressBase Premium CSV archives, split their records into one
/// compressed file per record type, and bulk load them into PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "abp-process")]
#[command(about = "Split AddressBase Premium archives by record type and load them into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Name of the database to (re)create and load
    name: String,

    /// Archives to process; defaults to every .zip in the current directory
    files: Vec<PathBuf>,

    /// Remove extracted CSV files once they have been split
    #[arg(short = 'r', long)]
    remove_extracted: bool,

    /// Only write the compressed type files, skip the database import
    #[arg(short = 'c', long, conflicts_with = "import_only")]
    compressed_only: bool,

    /// Only import existing type files, skip extraction and splitting
    #[arg(short = 'p', long)]
    import_only: bool,

    /// Abort on the first archive that fails to extract
    #[arg(long)]
    stop_on_archive_error: bool,

    /// PostgreSQL connection URL; the database part is ignored
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/postgres")]
    database_url: String,

    /// Database to connect to while dropping and creating the target
    #[arg(long, default_value = DEFAULT_MAINTENANCE_DATABASE)]
    maintenance_db: String,

    /// Directory holding the `unpacked/` and `types/` working directories
    #[arg(short = 'w', long, default_value = ".")]
    work_dir: PathBuf,

    /// Directory of record header files
    #[arg(long, default_value = "resources/headers")]
    headers_dir: PathBuf,

    /// Schema script run against the new database
    #[arg(long, default_value = "resources/pg-scripts/PostgreSQL_AddressBase_Premium_CreateTable.sql")]
    schema: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: LogLevel,
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            remove_extracted: self.remove_extracted,
            compressed_only: self.compressed_only,
            import_only: self.import_only,
            stop_on_archive_error: self.stop_on_archive_error,
        }
    }

    /// Archives named on the command line, or every archive in the current
    /// directory when none were given.
    fn archives(&self) -> Result<Vec<PathBuf>> {
        if !self.files.is_empty() || self.import_only {
            return Ok(self.files.clone());
        }

        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        find_archives(&cwd).with_context(|| format!("Failed to list archives in {}", cwd.display()))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.log_level)?;

    let start = Instant::now();
    let summary = run(&args).await?;
    report(&summary);

    info!("Processing complete in {}", format_elapsed(start.elapsed()));
    Ok(())
}

async fn run(args: &Cli) -> Result<RunSummary> {
    let options = args.run_options();
    let archives = args.archives()?;
    if archives.is_empty() && !options.import_only {
        warn!("No archives to process");
    }

    let catalog = HeaderCatalog::load(&args.headers_dir)
        .with_context(|| format!("Failed to load headers from {}", args.headers_dir.display()))?;
    if catalog.is_empty() && !options.import_only {
        warn!(dir = %args.headers_dir.display(), "No record header files found");
    }
    info!(headers = catalog.len(), "Loaded record headers");

    let schema = if options.compressed_only {
        String::new()
    } else {
        fs::read_to_string(&args.schema)
            .with_context(|| format!("Failed to read schema script {}", args.schema.display()))?
    };

    let settings = DatabaseSettings::new(&args.database_url).with_maintenance_database(&args.maintenance_db);
    let store = PgStore::new(settings.connect_options()?, settings.maintenance_database());
    let loader = PostgresLoader::new(store, TableMap::address_base(), schema);

    let mut processor = Processor::validated(
        &args.name,
        DirLayout::under(&args.work_dir),
        options,
        catalog,
        loader,
    )
    .context("Invalid configuration")?;

    processor
        .run(&archives)
        .await
        .with_context(|| format!("Processing into database '{}' failed", args.name))
}

fn report(summary: &RunSummary) {
    if let Some(process) = &summary.process {
        info!(
            archives = process.archives_processed,
            failed = process.archives_failed.len(),
            "Split {} records ({} malformed lines) into {} type files in {}",
            format_count(process.split.records as usize),
            format_count(process.split.malformed as usize),
            process.type_files.len(),
            format_elapsed(process.elapsed)
        );
        for (archive, error) in &process.archives_failed {
            warn!(archive = %archive.display(), "Archive skipped: {error}");
        }
    }

    if let Some(import) = &summary.import {
        for table in &import.tables {
            info!(
                table = %table.table,
                indexes = table.indexes.len(),
                "{} rows",
                format_count(table.rows as usize)
            );
        }
        info!(
            tables = import.tables.len(),
            skipped = import.skipped.len(),
            "Imported {} rows",
            format_count(import.total_rows() as usize)
        );
    }
}
