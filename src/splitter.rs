//! Classifies AddressBase Premium CSV lines by record type.
//!
//! Extracted CSV files mix every record type in one stream; the first field of
//! each line is its type code. The splitter streams a file line by line and
//! appends every line, byte for byte, to the `t<code>.csv.gz` sink of its type.
//!
//! # Example
//!
//! ```no_run
//! use abp_process::headers::HeaderCatalog;
//! use abp_process::registry::TypeFileRegistry;
//! use abp_process::splitter::split_file;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = HeaderCatalog::load(Path::new("resources/headers"))?;
//! let mut registry = TypeFileRegistry::new("types", catalog);
//!
//! let summary = split_file(Path::new("unpacked/AddressBasePremium_FULL_001.csv"), &mut registry)?;
//! println!("{} records, {} malformed", summary.records, summary.malformed);
//!
//! registry.close_all()?;
//! # Ok(())
//! # }
//! ```

use crate::error::SplitError;
use crate::headers::TypeCode;
use crate::registry::TypeFileRegistry;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

const DELIMITER: u8 = b',';

/// Counts from splitting one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitSummary {
    /// Lines read, including malformed ones
    pub lines: u64,
    /// Lines written to a type file
    pub records: u64,
    /// Lines without a delimiter, dropped
    pub malformed: u64,
    /// Records written per type
    pub per_type: BTreeMap<TypeCode, u64>,
}

impl SplitSummary {
    /// Adds another file's counts to this one.
    pub fn merge(&mut self, other: &SplitSummary) {
        self.lines += other.lines;
        self.records += other.records;
        self.malformed += other.malformed;
        for (code, count) in &other.per_type {
            *self.per_type.entry(code.clone()).or_default() += count;
        }
    }
}

/// Returns the type code of a record line, or `None` if the line has no
/// delimiter.
///
/// # Examples
///
/// ```
/// use abp_process::splitter::type_code_of;
///
/// assert_eq!(type_code_of(b"21,I,1,10000\n").unwrap().as_str(), "21");
/// assert!(type_code_of(b"no delimiter here\n").is_none());
/// ```
pub fn type_code_of(line: &[u8]) -> Option<TypeCode> {
    let idx = line.iter().position(|&b| b == DELIMITER)?;
    Some(TypeCode::new(String::from_utf8_lossy(&line[..idx])))
}

/// Splits one extracted CSV file into the registry's per-type sinks.
///
/// Memory use is bounded by the longest line. Sinks are left open so later
/// files keep appending to them.
///
/// # Errors
///
/// * [`SplitError::Read`] if the file cannot be read
/// * [`SplitError::UnknownType`] on the first line whose type has no header;
///   lines before it have already been written
/// * [`SplitError::Sink`] if a type file cannot be written
pub fn split_file(path: &Path, registry: &mut TypeFileRegistry) -> Result<SplitSummary, SplitError> {
    let read_error = |source| SplitError::Read {
        path: path.to_path_buf(),
        source,
    };

    info!(path = %path.display(), "Processing csv");
    let start = Instant::now();

    let file = File::open(path).map_err(read_error)?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::with_capacity(1024);
    let mut summary = SplitSummary::default();

    loop {
        line.clear();
        let bytes_read = reader.read_until(b'\n', &mut line).map_err(read_error)?;
        if bytes_read == 0 {
            break;
        }
        summary.lines += 1;

        let Some(code) = type_code_of(&line) else {
            summary.malformed += 1;
            continue;
        };

        // Keep sinks line aligned when the last line of a file has no terminator.
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }

        let sink = registry.get_or_create(&code).map_err(|e| match e {
            SplitError::UnknownType { type_code, .. } => SplitError::UnknownType {
                type_code,
                path: path.to_path_buf(),
                line: summary.lines,
            },
            other => other,
        })?;
        sink.write_line(&line)?;

        summary.records += 1;
        *summary.per_type.entry(code).or_default() += 1;
    }

    for (code, count) in &summary.per_type {
        debug!(path = %path.display(), type_code = %code, records = count, "Classified records");
    }
    info!(
        path = %path.display(),
        records = summary.records,
        malformed = summary.malformed,
        types = summary.per_type.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Finished processing csv"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderCatalog;
    use flate2::read::GzDecoder;
    use std::fs;
    use std::io::Read;
    use tempfile::TempDir;

    fn read_gz(path: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn catalog() -> HeaderCatalog {
        HeaderCatalog::from_entries([
            ("11", "street,val\n"),
            ("15", "descriptor,val\n"),
            ("99", "trailer,val\n"),
        ])
    }

    #[test]
    fn test_type_code_of() {
        assert_eq!(type_code_of(b"11,ABC\n"), Some(TypeCode::from("11")));
        assert_eq!(type_code_of(b",empty code\n"), Some(TypeCode::from("")));
        assert_eq!(type_code_of(b"11\n"), None);
        assert_eq!(type_code_of(b""), None);
    }

    #[test]
    fn test_split_example_scenario() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        fs::write(&input, "11,ABC\n15,DEF\n99,GHI\n").unwrap();

        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        let summary = split_file(&input, &mut registry).unwrap();
        registry.close_all().unwrap();

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.malformed, 0);
        assert_eq!(read_gz(&dir.path().join("t11.csv.gz")), b"street,val\n11,ABC\n");
        assert_eq!(read_gz(&dir.path().join("t15.csv.gz")), b"descriptor,val\n15,DEF\n");
        assert_eq!(read_gz(&dir.path().join("t99.csv.gz")), b"trailer,val\n99,GHI\n");
    }

    #[test]
    fn test_split_unknown_type_fails_at_line() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        fs::write(&input, "11,ABC\n15,DEF\n99,GHI\n").unwrap();

        let catalog = HeaderCatalog::from_entries([("11", "street,val"), ("15", "descriptor,val")]);
        let mut registry = TypeFileRegistry::new(dir.path(), catalog);
        let err = split_file(&input, &mut registry).unwrap_err();

        match err {
            SplitError::UnknownType { type_code, path, line } => {
                assert_eq!(type_code, "99");
                assert_eq!(path, input);
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(registry.len(), 2);
        assert!(!dir.path().join("t99.csv.gz").exists());
    }

    #[test]
    fn test_split_drops_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        fs::write(&input, "garbage without delimiter\n\n11,ABC\n").unwrap();

        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        let summary = split_file(&input, &mut registry).unwrap();

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.malformed, 2);
        assert_eq!(summary.records, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_split_preserves_line_bytes() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        fs::write(&input, b"11,\"Caf\xc3\xa9, Rue\",  spaced  \r\n").unwrap();

        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        split_file(&input, &mut registry).unwrap();
        registry.close_all().unwrap();

        let mut expected = b"street,val\n".to_vec();
        expected.extend_from_slice(b"11,\"Caf\xc3\xa9, Rue\",  spaced  \r\n");
        assert_eq!(read_gz(&dir.path().join("t11.csv.gz")), expected);
    }

    #[test]
    fn test_split_accumulates_across_files() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("a.csv");
        let second = dir.path().join("b.csv");
        fs::write(&first, "11,A\n11,B").unwrap();
        fs::write(&second, "11,C\n15,D\n").unwrap();

        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        let mut total = split_file(&first, &mut registry).unwrap();
        total.merge(&split_file(&second, &mut registry).unwrap());
        registry.close_all().unwrap();

        assert_eq!(total.records, 4);
        assert_eq!(total.per_type[&TypeCode::from("11")], 3);
        assert_eq!(total.per_type[&TypeCode::from("15")], 1);
        assert_eq!(
            read_gz(&dir.path().join("t11.csv.gz")),
            b"street,val\n11,A\n11,B\n11,C\n"
        );
    }

    #[test]
    fn test_split_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut registry = TypeFileRegistry::new(dir.path(), catalog());
        let result = split_file(&dir.path().join("missing.csv"), &mut registry);
        assert!(matches!(result, Err(SplitError::Read { .. })));
    }
}
