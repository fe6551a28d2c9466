//! Runs the whole pipeline: extract archives, split them by record type,
//! then hand the type files to a [`Loader`].
//!
//! # Example
//!
//! ```no_run
//! use abp_process::config::{DatabaseSettings, DirLayout, RunOptions};
//! use abp_process::headers::HeaderCatalog;
//! use abp_process::loader::{PgStore, PostgresLoader};
//! use abp_process::processor::Processor;
//! use abp_process::tables::TableMap;
//! use std::path::{Path, PathBuf};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = DatabaseSettings::new("postgres://localhost/postgres");
//! let store = PgStore::new(settings.connect_options()?, settings.maintenance_database());
//! let loader = PostgresLoader::new(store, TableMap::address_base(), "-- schema");
//!
//! let mut processor = Processor::new(
//!     "abp",
//!     DirLayout::under(Path::new(".")),
//!     RunOptions::default(),
//!     HeaderCatalog::load(Path::new("resources/headers"))?,
//!     loader,
//! )?;
//! processor.run(&[PathBuf::from("AddressBasePremium_FULL_001.zip")]).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{DirLayout, RunOptions};
use crate::error::{ExtractError, ProcessError};
use crate::headers::HeaderCatalog;
use crate::loader::{ImportSummary, Loader, PostgresLoader, TargetStore};
use crate::registry::{ClosedSink, TypeFileRegistry};
use crate::splitter::{SplitSummary, split_file};
use crate::unzip::extract_archive;
use crate::utilities::{format_count, format_elapsed};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Result of splitting a batch of archives.
#[derive(Debug, Default)]
pub struct ProcessSummary {
    pub archives_processed: usize,
    /// Archives that failed to extract, with the reason
    pub archives_failed: Vec<(PathBuf, ExtractError)>,
    pub split: SplitSummary,
    /// Type files written, sorted by type code
    pub type_files: Vec<ClosedSink>,
    pub elapsed: Duration,
}

/// Result of a full run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub process: Option<ProcessSummary>,
    pub import: Option<ImportSummary>,
}

/// Sequences extraction, splitting and loading for one target database.
#[derive(Debug)]
pub struct Processor<L> {
    database: String,
    layout: DirLayout,
    options: RunOptions,
    catalog: HeaderCatalog,
    loader: L,
}

impl<L: Loader> Processor<L> {
    /// Builds a processor and creates the working directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn new(
        database: impl Into<String>,
        layout: DirLayout,
        options: RunOptions,
        catalog: HeaderCatalog,
        loader: L,
    ) -> Result<Self, ProcessError> {
        layout.ensure()?;

        Ok(Self {
            database: database.into(),
            layout,
            options,
            catalog,
            loader,
        })
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Extracts and splits every archive into the types directory.
    ///
    /// Does nothing in import-only mode. An archive that fails to extract is
    /// logged and skipped unless [`RunOptions::stop_on_archive_error`] is set;
    /// any splitting error ends the batch. The type files are closed exactly
    /// once however this returns.
    pub fn process(&self, archives: &[PathBuf]) -> Result<ProcessSummary, ProcessError> {
        if self.options.import_only {
            info!("Import only, skipping extraction and splitting");
            return Ok(ProcessSummary::default());
        }

        let start = Instant::now();
        let mut registry = TypeFileRegistry::new(&self.layout.types, self.catalog.clone());
        let mut summary = ProcessSummary::default();

        let outcome = self.process_archives(archives, &mut registry, &mut summary);
        let closed = registry.close_all();

        summary.elapsed = start.elapsed();
        info!("Processing time: {}", format_elapsed(summary.elapsed));

        outcome?;
        summary.type_files = closed?;

        for file in &summary.type_files {
            info!(
                type_code = %file.type_code,
                path = %file.path.display(),
                "Wrote {} records",
                format_count(file.records as usize)
            );
        }

        Ok(summary)
    }

    fn process_archives(
        &self,
        archives: &[PathBuf],
        registry: &mut TypeFileRegistry,
        summary: &mut ProcessSummary,
    ) -> Result<(), ProcessError> {
        for archive in archives {
            let extracted = match extract_archive(archive, &self.layout.unpacked) {
                Ok(extracted) => extracted,
                Err(e) if !self.options.stop_on_archive_error => {
                    error!(archive = %archive.display(), error = %e, "Skipping archive");
                    summary.archives_failed.push((archive.clone(), e));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for file in &extracted {
                let file_summary = split_file(file, registry)?;
                summary.split.merge(&file_summary);
                self.remove_extracted(file)?;
            }

            summary.archives_processed += 1;
        }

        Ok(())
    }

    fn remove_extracted(&self, file: &Path) -> Result<(), ProcessError> {
        if !self.options.remove_extracted {
            return Ok(());
        }

        info!(path = %file.display(), "Removing extracted file");
        fs::remove_file(file).map_err(|source| ProcessError::Cleanup {
            path: file.to_path_buf(),
            source,
        })
    }

    /// Loads the types directory into the target database.
    pub async fn import_to_postgres(&mut self) -> Result<ImportSummary, ProcessError> {
        let summary = self.loader.load(&self.layout.types, &self.database).await?;
        Ok(summary)
    }

    /// Splits `archives` (unless import-only) and imports the result (unless
    /// compressed-only).
    pub async fn run(&mut self, archives: &[PathBuf]) -> Result<RunSummary, ProcessError> {
        let mut summary = RunSummary::default();

        if !self.options.import_only {
            summary.process = Some(self.process(archives)?);
        }

        if self.options.compressed_only {
            info!("Compressed files only, skipping database import");
        } else {
            summary.import = Some(self.import_to_postgres().await?);
        }

        Ok(summary)
    }
}

impl<S: TargetStore> Processor<PostgresLoader<S>> {
    /// Like [`Processor::new`], but also checks every mapped table's record
    /// type has a header, so a missing header file is caught before any
    /// archive is opened.
    pub fn validated(
        database: impl Into<String>,
        layout: DirLayout,
        options: RunOptions,
        catalog: HeaderCatalog,
        loader: PostgresLoader<S>,
    ) -> Result<Self, ProcessError> {
        if !options.import_only {
            loader.tables().validate_against(&catalog)?;
        }

        Self::new(database, layout, options, catalog, loader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::BackpressurePolicy;
    use crate::error::{LoadError, SplitError};
    use crate::loader::CopyReport;
    use crate::tables::{TableMap, TableMapping};
    use async_trait::async_trait;
    use flate2::read::GzDecoder;
    use std::fs::File;
    use std::io::{Read, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Records the directory and database it was asked to load.
    #[derive(Debug, Default)]
    struct StubLoader {
        calls: Vec<(PathBuf, String)>,
    }

    #[async_trait]
    impl Loader for StubLoader {
        async fn load(&mut self, dir: &Path, database: &str) -> Result<ImportSummary, LoadError> {
            self.calls.push((dir.to_path_buf(), database.to_string()));
            Ok(ImportSummary::default())
        }
    }

    /// Counts data rows per table by decompressing the copied files.
    #[derive(Debug, Default)]
    struct CountingStore {
        rows: Vec<(String, u64)>,
    }

    #[async_trait]
    impl TargetStore for CountingStore {
        async fn recreate_database(&mut self, _name: &str) -> Result<(), LoadError> {
            self.rows.clear();
            Ok(())
        }

        async fn apply_schema(&mut self, _ddl: &str) -> Result<(), LoadError> {
            Ok(())
        }

        async fn copy_file(
            &mut self,
            table: &str,
            path: &Path,
            policy: &BackpressurePolicy,
        ) -> Result<CopyReport, LoadError> {
            let mut channel = crate::copy::tests::RecordingChannel::default();
            let progress = crate::copy::stream_gzip_file(path, table, &mut channel, policy).await?;
            self.rows.push((table.to_string(), progress.data_rows()));
            Ok(CopyReport {
                rows: progress.data_rows(),
                progress,
            })
        }

        async fn create_index(&mut self, _index: &str, _table: &str, _column: &str) -> Result<(), LoadError> {
            Ok(())
        }
    }

    fn write_zip(path: &Path, name: &str, contents: &str) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn catalog() -> HeaderCatalog {
        HeaderCatalog::from_entries([("11", "street,val"), ("15", "descriptor,val"), ("99", "trailer,val")])
    }

    fn processor<L: Loader>(root: &Path, options: RunOptions, loader: L) -> Processor<L> {
        Processor::new("abp", DirLayout::under(root), options, catalog(), loader).unwrap()
    }

    #[test]
    fn test_process_example_archive() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, "a.csv", "11,ABC\n15,DEF\n99,GHI\n");

        let processor = processor(dir.path(), RunOptions::default(), StubLoader::default());
        let summary = processor.process(&[archive]).unwrap();

        let types = dir.path().join("types");
        assert_eq!(summary.archives_processed, 1);
        assert_eq!(summary.split.records, 3);
        assert_eq!(summary.type_files.len(), 3);
        assert_eq!(read_gz(&types.join("t11.csv.gz")), "street,val\n11,ABC\n");
        assert_eq!(read_gz(&types.join("t15.csv.gz")), "descriptor,val\n15,DEF\n");
        assert_eq!(read_gz(&types.join("t99.csv.gz")), "trailer,val\n99,GHI\n");
        assert!(dir.path().join("unpacked").join("a.csv").exists());
    }

    #[test]
    fn test_process_removes_extracted_files() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, "a.csv", "11,ABC\n");

        let options = RunOptions {
            remove_extracted: true,
            ..Default::default()
        };
        let processor = processor(dir.path(), options, StubLoader::default());
        processor.process(&[archive]).unwrap();

        assert!(!dir.path().join("unpacked").join("a.csv").exists());
    }

    #[test]
    fn test_process_continues_past_bad_archive() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.zip");
        write_zip(&good, "good.csv", "11,ABC\n11,DEF\n");
        let bad = dir.path().join("bad.zip");
        fs::write(&bad, b"not a zip").unwrap();

        let processor = processor(dir.path(), RunOptions::default(), StubLoader::default());
        let summary = processor.process(&[bad.clone(), good]).unwrap();

        assert_eq!(summary.archives_processed, 1);
        assert_eq!(summary.archives_failed.len(), 1);
        assert_eq!(summary.archives_failed[0].0, bad);
        assert_eq!(summary.split.records, 2);
    }

    #[test]
    fn test_process_stops_on_bad_archive_when_configured() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.zip");
        fs::write(&bad, b"not a zip").unwrap();

        let options = RunOptions {
            stop_on_archive_error: true,
            ..Default::default()
        };
        let processor = processor(dir.path(), options, StubLoader::default());
        let err = processor.process(&[bad]).unwrap_err();
        assert!(matches!(err, ProcessError::Extract(_)));
    }

    #[test]
    fn test_unknown_type_fails_but_closes_type_files() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.zip");
        write_zip(&first, "a.csv", "11,ABC\n");
        let second = dir.path().join("b.zip");
        write_zip(&second, "b.csv", "15,DEF\n42,UNKNOWN\n");

        let processor = processor(dir.path(), RunOptions::default(), StubLoader::default());
        let err = processor.process(&[first, second]).unwrap_err();

        assert!(matches!(err, ProcessError::Split(SplitError::UnknownType { .. })));
        let types = dir.path().join("types");
        assert_eq!(read_gz(&types.join("t11.csv.gz")), "street,val\n11,ABC\n");
        assert_eq!(read_gz(&types.join("t15.csv.gz")), "descriptor,val\n15,DEF\n");
    }

    #[test]
    fn test_process_accumulates_across_archives() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.zip");
        write_zip(&first, "a.csv", "11,A\n15,X\n11,B\n");
        let second = dir.path().join("b.zip");
        write_zip(&second, "b.csv", "11,C\n");

        let processor = processor(dir.path(), RunOptions::default(), StubLoader::default());
        let summary = processor.process(&[first, second]).unwrap();

        let street = summary
            .type_files
            .iter()
            .find(|f| f.type_code.as_str() == "11")
            .unwrap();
        assert_eq!(street.records, 3);
        assert_eq!(read_gz(&street.path).lines().count(), 4);
    }

    #[tokio::test]
    async fn test_run_import_only_skips_archives() {
        let dir = TempDir::new().unwrap();
        let options = RunOptions {
            import_only: true,
            ..Default::default()
        };
        let mut processor = processor(dir.path(), options, StubLoader::default());

        let summary = processor
            .run(&[dir.path().join("never-opened.zip")])
            .await
            .unwrap();

        assert!(summary.process.is_none());
        assert!(summary.import.is_some());
        assert_eq!(
            processor.loader().calls,
            vec![(dir.path().join("types"), "abp".to_string())]
        );
    }

    #[tokio::test]
    async fn test_run_compressed_only_skips_import() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("a.zip");
        write_zip(&archive, "a.csv", "11,ABC\n");
        let options = RunOptions {
            compressed_only: true,
            ..Default::default()
        };
        let mut processor = processor(dir.path(), options, StubLoader::default());

        let summary = processor.run(&[archive]).await.unwrap();

        assert!(summary.process.is_some());
        assert!(summary.import.is_none());
        assert!(processor.loader().calls.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_row_counts() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.zip");
        write_zip(&first, "a.csv", "11,A\n15,X\n99,T\n");
        let second = dir.path().join("b.zip");
        write_zip(&second, "b.csv", "11,B\n11,C\n");

        let tables = TableMap::new([
            TableMapping::new("11", "abp_street", &["usrn"]),
            TableMapping::new("15", "abp_street_descriptor", &["usrn"]),
        ])
        .unwrap();
        let loader = PostgresLoader::new(CountingStore::default(), tables, "");
        let mut processor =
            Processor::validated("abp", DirLayout::under(dir.path()), RunOptions::default(), catalog(), loader)
                .unwrap();

        let summary = processor.run(&[first, second]).await.unwrap();
        let import = summary.import.unwrap();

        assert_eq!(
            processor.loader().store().rows,
            vec![
                ("abp_street".to_string(), 3),
                ("abp_street_descriptor".to_string(), 1)
            ]
        );
        assert_eq!(import.skipped, vec![dir.path().join("types").join("t99.csv.gz")]);
    }

    #[test]
    fn test_validated_requires_headers_for_mapped_tables() {
        let dir = TempDir::new().unwrap();
        let loader = PostgresLoader::new(CountingStore::default(), TableMap::address_base(), "");

        let result = Processor::validated(
            "abp",
            DirLayout::under(dir.path()),
            RunOptions::default(),
            catalog(),
            loader,
        );
        assert!(matches!(result, Err(ProcessError::Config(_))));
    }
}
