//! Record type codes and their CSV header lines.
//!
//! Every AddressBase Premium record starts with a numeric type code. The
//! header line for each type lives in its own resource file; the first line
//! of that file is written at the top of the matching `t<code>.csv.gz`.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, warn};

/// The leading field of a record line, e.g. `11` for a street record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeCode(String);

impl TypeCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the compressed per-type file, `t<code>.csv.gz`.
    pub fn file_name(&self) -> String {
        format!("t{}.csv.gz", self.0)
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// A record type and the resource file holding its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderResource {
    pub type_code: &'static str,
    pub file_name: &'static str,
}

impl HeaderResource {
    #[must_use]
    pub const fn new(type_code: &'static str, file_name: &'static str) -> Self {
        Self {
            type_code,
            file_name,
        }
    }
}

/// Header resource files shipped with the AddressBase Premium product.
pub const HEADER_RESOURCES: [HeaderResource; 12] = [
    HeaderResource::new("10", "Record_10_HEADER_Header.csv"),
    HeaderResource::new("11", "Record_11_STREET_Header.csv"),
    HeaderResource::new("15", "Record_15_STREETDESCRIPTOR_Header.csv"),
    HeaderResource::new("21", "Record_21_BLPU_Header.csv"),
    HeaderResource::new("23", "Record_23_XREF_Header.csv"),
    HeaderResource::new("24", "Record_24_LPI_Header.csv"),
    HeaderResource::new("28", "Record_28_DELIVERYPOINTADDRESS_Header.csv"),
    HeaderResource::new("29", "Record_29_METADATA_Header.csv"),
    HeaderResource::new("30", "Record_30_SUCCESSOR_Header.csv"),
    HeaderResource::new("31", "Record_31_ORGANISATION_Header.csv"),
    HeaderResource::new("32", "Record_32_CLASSIFICATION_Header.csv"),
    HeaderResource::new("99", "Record_99_TRAILER_Header.csv"),
];

/// Immutable lookup from type code to header line.
///
/// Header lines are stored with a trailing `\n` so they can be written to a
/// sink as-is.
#[derive(Debug, Clone, Default)]
pub struct HeaderCatalog {
    headers: HashMap<TypeCode, String>,
}

impl HeaderCatalog {
    /// Builds a catalog from `(code, header)` pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use abp_process::headers::{HeaderCatalog, TypeCode};
    ///
    /// let catalog = HeaderCatalog::from_entries([("11", "street,val")]);
    /// assert_eq!(catalog.header(&TypeCode::from("11")), Some("street,val\n"));
    /// assert!(catalog.header(&TypeCode::from("15")).is_none());
    /// ```
    pub fn from_entries<I, C, H>(entries: I) -> Self
    where
        I: IntoIterator<Item = (C, H)>,
        C: Into<String>,
        H: Into<String>,
    {
        let headers = entries
            .into_iter()
            .map(|(code, header)| (TypeCode::new(code), terminate(header.into())))
            .collect();

        Self { headers }
    }

    /// Loads the first line of every file in [`HEADER_RESOURCES`] found in `dir`.
    ///
    /// Missing files are left out with a warning; data of that type will then
    /// fail the split when it shows up.
    ///
    /// # Errors
    ///
    /// Returns an error if a header file exists but cannot be read.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let mut headers = HashMap::new();

        for resource in &HEADER_RESOURCES {
            let path = dir.join(resource.file_name);
            if !path.exists() {
                warn!(type_code = resource.type_code, path = %path.display(), "Header file not found");
                continue;
            }

            let header = read_first_line(&path)?;
            debug!(type_code = resource.type_code, path = %path.display(), "Loaded header");
            headers.insert(TypeCode::new(resource.type_code), terminate(header));
        }

        Ok(Self { headers })
    }

    /// Returns the header line (with trailing newline) for `code`.
    pub fn header(&self, code: &TypeCode) -> Option<&str> {
        self.headers.get(code).map(String::as_str)
    }

    pub fn contains(&self, code: &TypeCode) -> bool {
        self.headers.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

fn read_first_line(path: &Path) -> Result<String, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::HeaderFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut line = String::new();
    BufReader::new(file)
        .read_line(&mut line)
        .map_err(|source| ConfigError::HeaderFile {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(line)
}

fn terminate(mut header: String) -> String {
    if !header.ends_with('\n') {
        header.push('\n');
    }
    header
}
