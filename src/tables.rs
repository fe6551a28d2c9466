//! Mapping from record types to database tables and their indexes.
//!
//! Only record types listed here are imported; any other `t<code>.csv.gz`
//! file in the types directory is left alone.

use crate::error::ConfigError;
use crate::headers::{HeaderCatalog, TypeCode};
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the compressed per-type file names written by the splitter.
static TYPE_FILE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^t(\w+)\.csv\.gz$").expect("Invalid type file regex pattern"));

/// Plain, unquoted SQL identifiers.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex pattern"));

/// A record type, the table it is loaded into and the columns to index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMapping {
    pub type_code: &'static str,
    pub table: &'static str,
    pub indexes: &'static [&'static str],
}

impl TableMapping {
    #[must_use]
    pub const fn new(
        type_code: &'static str,
        table: &'static str,
        indexes: &'static [&'static str],
    ) -> Self {
        Self {
            type_code,
            table,
            indexes,
        }
    }

    /// Name of the index built on `column`, `idx_<table>_<column>`.
    pub fn index_name(&self, column: &str) -> String {
        format!("idx_{}_{}", self.table, column)
    }
}

/// The AddressBase Premium record types loaded into PostgreSQL.
pub const ADDRESS_BASE_TABLES: [TableMapping; 5] = [
    TableMapping::new("11", "abp_street", &["usrn"]),
    TableMapping::new("15", "abp_street_descriptor", &["usrn"]),
    TableMapping::new("21", "abp_blpu", &["uprn", "postcode_locator"]),
    TableMapping::new("24", "abp_lpi", &["uprn"]),
    TableMapping::new("28", "abp_delivery_point", &["uprn"]),
];

/// Validated set of table mappings.
#[derive(Debug, Clone)]
pub struct TableMap {
    mappings: Vec<TableMapping>,
}

impl TableMap {
    /// Builds a map, checking every table and column name is a plain identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidIdentifier`] for the first bad name.
    pub fn new(mappings: impl IntoIterator<Item = TableMapping>) -> Result<Self, ConfigError> {
        let mappings: Vec<TableMapping> = mappings.into_iter().collect();

        for mapping in &mappings {
            validate_identifier(mapping.table)?;
            for column in mapping.indexes {
                validate_identifier(column)?;
            }
        }

        Ok(Self { mappings })
    }

    /// The default AddressBase Premium mapping.
    pub fn address_base() -> Self {
        Self {
            mappings: ADDRESS_BASE_TABLES.to_vec(),
        }
    }

    pub fn get(&self, code: &TypeCode) -> Option<&TableMapping> {
        self.mappings.iter().find(|m| m.type_code == code.as_str())
    }

    /// Resolves a file name such as `t21.csv.gz` to its mapping.
    ///
    /// # Examples
    ///
    /// ```
    /// use abp_process::tables::TableMap;
    ///
    /// let tables = TableMap::address_base();
    /// assert_eq!(tables.for_file_name("t21.csv.gz").unwrap().table, "abp_blpu");
    /// assert!(tables.for_file_name("t99.csv.gz").is_none());
    /// assert!(tables.for_file_name("notes.txt").is_none());
    /// ```
    pub fn for_file_name(&self, file_name: &str) -> Option<&TableMapping> {
        type_code_from_file_name(file_name).and_then(|code| self.get(&code))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableMapping> {
        self.mappings.iter()
    }

    /// Checks every mapped record type has a header, so a headerless type
    /// file can never be produced for an importable table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingHeader`] for the first type without one.
    pub fn validate_against(&self, catalog: &HeaderCatalog) -> Result<(), ConfigError> {
        for mapping in &self.mappings {
            if !catalog.contains(&TypeCode::from(mapping.type_code)) {
                return Err(ConfigError::MissingHeader {
                    type_code: mapping.type_code.to_string(),
                    table: mapping.table.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Extracts the type code from a `t<code>.csv.gz` file name.
pub fn type_code_from_file_name(file_name: &str) -> Option<TypeCode> {
    TYPE_FILE_NAME
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| TypeCode::new(m.as_str()))
}

/// Rejects anything that is not a plain SQL identifier.
///
/// Names are interpolated into DDL, so only `[A-Za-z_][A-Za-z0-9_]*` is
/// accepted.
pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}
