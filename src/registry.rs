//! Per-type gzip output files for one processing run.
//!
//! The registry opens `t<code>.csv.gz` the first time a record type is seen,
//! writes the type's header line, and keeps the stream open for the rest of
//! the run so records from several archives accumulate in one file.
//! [`TypeFileRegistry::close_all`] finishes every stream; anything still open
//! when the registry is dropped is finished then.

use crate::error::SplitError;
use crate::headers::{HeaderCatalog, TypeCode};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

type Encoder = GzEncoder<BufWriter<File>>;

/// An open compressed output stream for one record type.
#[derive(Debug)]
pub struct TypeSink {
    type_code: TypeCode,
    path: PathBuf,
    encoder: Option<Encoder>,
    records: u64,
}

impl TypeSink {
    fn create(type_code: TypeCode, path: PathBuf, header: &str) -> Result<Self, SplitError> {
        let file = File::create(&path).map_err(|source| SplitError::Sink {
            path: path.clone(),
            source,
        })?;

        let mut sink = Self {
            type_code,
            path,
            encoder: Some(GzEncoder::new(BufWriter::new(file), Compression::default())),
            records: 0,
        };
        sink.write_raw(header.as_bytes())?;
        Ok(sink)
    }

    /// Appends one record line exactly as given.
    pub fn write_line(&mut self, line: &[u8]) -> Result<(), SplitError> {
        self.write_raw(line)?;
        self.records += 1;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SplitError> {
        let encoder = self.encoder.as_mut().ok_or_else(|| SplitError::Sink {
            path: self.path.clone(),
            source: std::io::Error::other("type file already closed"),
        })?;

        encoder.write_all(bytes).map_err(|source| SplitError::Sink {
            path: self.path.clone(),
            source,
        })
    }

    /// Finishes the gzip stream. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), SplitError> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };

        encoder
            .finish()
            .and_then(|mut writer| writer.flush())
            .map_err(|source| SplitError::Sink {
                path: self.path.clone(),
                source,
            })
    }

    /// Data lines written so far, not counting the header.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_open(&self) -> bool {
        self.encoder.is_some()
    }
}

/// What a sink wrote, reported when the registry is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSink {
    pub type_code: TypeCode,
    pub path: PathBuf,
    pub records: u64,
}

/// Owns the open [`TypeSink`]s of a run, at most one per record type.
#[derive(Debug)]
pub struct TypeFileRegistry {
    types_dir: PathBuf,
    catalog: HeaderCatalog,
    sinks: HashMap<TypeCode, TypeSink>,
}

impl TypeFileRegistry {
    pub fn new(types_dir: impl Into<PathBuf>, catalog: HeaderCatalog) -> Self {
        Self {
            types_dir: types_dir.into(),
            catalog,
            sinks: HashMap::new(),
        }
    }

    /// Returns the sink for `code`, creating it on first use.
    ///
    /// A new sink truncates any existing `t<code>.csv.gz` and starts with the
    /// type's header line.
    ///
    /// # Errors
    ///
    /// Returns [`SplitError::UnknownType`] (with an empty path and line 0;
    /// callers fill those in) when the catalog has no header for `code`, or
    /// [`SplitError::Sink`] if the file cannot be created.
    pub fn get_or_create(&mut self, code: &TypeCode) -> Result<&mut TypeSink, SplitError> {
        if !self.sinks.contains_key(code) {
            let header = self.catalog.header(code).ok_or_else(|| SplitError::UnknownType {
                type_code: code.to_string(),
                path: PathBuf::new(),
                line: 0,
            })?;

            let path = self.types_dir.join(code.file_name());
            info!(type_code = %code, path = %path.display(), "Creating new output file");
            let sink = TypeSink::create(code.clone(), path, header)?;
            self.sinks.insert(code.clone(), sink);
        }

        self.sinks.get_mut(code).ok_or_else(|| SplitError::UnknownType {
            type_code: code.to_string(),
            path: PathBuf::new(),
            line: 0,
        })
    }

    pub fn get(&self, code: &TypeCode) -> Option<&TypeSink> {
        self.sinks.get(code)
    }

    /// Number of open sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Finishes and removes every sink.
    ///
    /// All sinks are closed even if one fails; the first failure is returned.
    /// The report is sorted by type code.
    pub fn close_all(&mut self) -> Result<Vec<ClosedSink>, SplitError> {
        let mut closed = Vec::with_capacity(self.sinks.len());
        let mut first_error = None;

        for (code, mut sink) in self.sinks.drain() {
            match sink.close() {
                Ok(()) => {
                    debug!(type_code = %code, records = sink.records, "Closed type file");
                    closed.push(ClosedSink {
                        type_code: code,
                        path: sink.path,
                        records: sink.records,
                    });
                }
                Err(e) => {
                    warn!(type_code = %code, error = %e, "Failed to close type file");
                    first_error.get_or_insert(e);
                }
            }
        }

        closed.sort_by(|a, b| a.type_code.cmp(&b.type_code));

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

impl Drop for TypeFileRegistry {
    fn drop(&mut self) {
        if self.sinks.is_empty() {
            return;
        }

        if let Err(e) = self.close_all() {
            warn!(error = %e, "Failed to close type files on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;

    fn read_gz(path: &Path) -> String {
        let mut out = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
        out
    }

    fn catalog() -> HeaderCatalog {
        HeaderCatalog::from_entries([("11", "street,val"), ("15", "descriptor,val")])
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut registry = TypeFileRegistry::new(dir.path(), catalog());

        registry.get_or_create(&"11".into()).unwrap().write_line(b"11,A\n").unwrap();
        registry.get_or_create(&"11".into()).unwrap().write_line(b"11,B\n").unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&"11".into()).unwrap().records(), 2);

        let closed = registry.close_all().unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].records, 2);
        assert_eq!(read_gz(&dir.path().join("t11.csv.gz")), "street,val\n11,A\n11,B\n");
    }

    #[test]
    fn test_unknown_type_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let mut registry = TypeFileRegistry::new(dir.path(), catalog());

        let err = registry.get_or_create(&"99".into()).unwrap_err();
        assert!(matches!(err, SplitError::UnknownType { ref type_code, .. } if type_code == "99"));
        assert!(registry.is_empty());
        assert!(!dir.path().join("t99.csv.gz").exists());
    }

    #[test]
    fn test_close_all_twice() {
        let dir = TempDir::new().unwrap();
        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        registry.get_or_create(&"15".into()).unwrap();

        assert_eq!(registry.close_all().unwrap().len(), 1);
        assert!(registry.close_all().unwrap().is_empty());
        assert_eq!(read_gz(&dir.path().join("t15.csv.gz")), "descriptor,val\n");
    }

    #[test]
    fn test_drop_closes_open_sinks() {
        let dir = TempDir::new().unwrap();
        {
            let mut registry = TypeFileRegistry::new(dir.path(), catalog());
            registry.get_or_create(&"11".into()).unwrap().write_line(b"11,A\n").unwrap();
        }

        assert_eq!(read_gz(&dir.path().join("t11.csv.gz")), "street,val\n11,A\n");
    }

    #[test]
    fn test_closed_sink_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t11.csv.gz");
        let mut sink = TypeSink::create("11".into(), path, "street,val\n").unwrap();

        sink.close().unwrap();
        assert!(!sink.is_open());
        assert!(sink.close().is_ok());
        assert!(matches!(sink.write_line(b"11,A\n"), Err(SplitError::Sink { .. })));
    }

    #[test]
    fn test_close_all_sorted_by_type() {
        let dir = TempDir::new().unwrap();
        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        registry.get_or_create(&"15".into()).unwrap();
        registry.get_or_create(&"11".into()).unwrap();

        let codes: Vec<_> = registry
            .close_all()
            .unwrap()
            .into_iter()
            .map(|c| c.type_code.to_string())
            .collect();
        assert_eq!(codes, vec!["11", "15"]);
    }
}
