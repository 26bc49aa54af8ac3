//! Table I/O - string-cell table model and the row source/sink boundary
//!
//! The engine never parses file formats itself; tables move through the
//! `TableStore` trait as whole row sets. Cells stay raw strings end to end so
//! non-identifier columns survive a rewrite verbatim.

use crate::error::{IdrError, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::fs;
use std::path::{Path, PathBuf};

/// In-memory table: a header row plus string cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Index of a named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Index of a required column, as a schema error when absent.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| IdrError::Schema(format!("missing required column '{}'", name)))
    }

    /// Cell at (row, column); empty string when the row is short.
    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(|c| c.as_str())
            .unwrap_or("")
    }
}

/// Row source/sink boundary. CSV ships in-crate; other formats (XLSX) are
/// collaborator implementations injected by the embedding application.
pub trait TableStore {
    /// Read a whole table from a file.
    fn read_table(&self, path: &Path) -> Result<Table>;

    /// Write a whole table to a file, replacing any existing content.
    fn write_table(&self, path: &Path, table: &Table) -> Result<()>;
}

/// CSV-backed table store.
#[derive(Debug, Default)]
pub struct CsvTableStore;

impl CsvTableStore {
    pub fn new() -> Self {
        Self
    }

    fn check_extension(path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext == "csv" {
            Ok(())
        } else {
            Err(IdrError::UnsupportedFormat(format!(
                "{} (the built-in store handles .csv only)",
                path.display()
            )))
        }
    }
}

impl TableStore for CsvTableStore {
    fn read_table(&self, path: &Path) -> Result<Table> {
        Self::check_extension(path)?;
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;

        let headers = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
            // Short rows pad out so column indexes stay valid.
            while cells.len() < headers.len() {
                cells.push(String::new());
            }
            rows.push(cells);
        }

        Ok(Table { headers, rows })
    }

    fn write_table(&self, path: &Path, table: &Table) -> Result<()> {
        Self::check_extension(path)?;
        let mut wtr = WriterBuilder::new().flexible(true).from_path(path)?;
        wtr.write_record(&table.headers)?;
        for row in &table.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Copy a file to `<name>.<ext>.backup` before its first rewrite. An existing
/// backup is kept as-is so the earliest original survives repeated runs.
pub fn create_backup(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IdrError::FileNotFound(path.display().to_string()))?;
    let backup = path.with_file_name(format!("{}.backup", file_name));
    if !backup.exists() {
        fs::copy(path, &backup)?;
    }
    Ok(backup)
}

/// Locate a file by configured name relative to a base directory: direct
/// join first, then an absolute path, then a recursive scan of
/// subdirectories matching on the final path component.
pub fn find_file(base: &Path, name: &str) -> Result<PathBuf> {
    let direct = base.join(name);
    if direct.exists() {
        return Ok(direct);
    }
    let as_path = Path::new(name);
    if as_path.is_absolute() && as_path.exists() {
        return Ok(as_path.to_path_buf());
    }
    let target = as_path.file_name().and_then(|n| n.to_str()).unwrap_or(name);
    if let Some(found) = scan_for_file(base, target) {
        return Ok(found);
    }
    Err(IdrError::FileNotFound(format!(
        "{} under {}",
        name,
        base.display()
    )))
}

fn scan_for_file(dir: &Path, target: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if path.file_name().and_then(|n| n.to_str()) == Some(target) {
            return Some(path);
        }
    }
    for sub in subdirs {
        if let Some(found) = scan_for_file(&sub, target) {
            return Some(found);
        }
    }
    None
}
