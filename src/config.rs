//! Run configuration - which files to process and how identifier columns bind

use crate::error::{IdrError, Result};
use crate::table::Table;
use itertools::Itertools;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Case-sensitive processed-flag literals.
pub const PROCESSED_TRUE: &str = "True";
pub const PROCESSED_FALSE: &str = "False";

pub const CONFIG_COLUMNS: [&str; 7] = [
    "mapping_file",
    "mapping_id",
    "source_file",
    "source_id",
    "id_type",
    "source_context",
    "processed",
];

/// Lifecycle of one configuration row within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Unprocessed,
    InProgress,
    Processed,
    Failed,
}

/// One file-pair binding from the configuration table.
#[derive(Debug, Clone)]
pub struct ConfigRow {
    pub mapping_file: String,
    pub mapping_id: String,
    pub source_file: String,
    pub source_id: String,
    pub id_type: String,
    pub source_context: String,
    pub processed: bool,
    pub state: RowState,
}

impl ConfigRow {
    /// Identifier type for lookups; legacy configurations leave `id_type`
    /// empty and inherit the mapping column name.
    pub fn effective_id_type(&self) -> &str {
        let explicit = self.id_type.trim();
        if explicit.is_empty() {
            self.mapping_id.trim()
        } else {
            explicit
        }
    }
}

#[derive(Debug)]
pub struct RunConfig {
    pub path: PathBuf,
    pub rows: Vec<ConfigRow>,
}

impl RunConfig {
    /// Parse the configuration table. Missing required columns are fatal for
    /// the run; `id_type`, `source_context` and `processed` are optional so
    /// legacy configurations load unchanged.
    pub fn load(table: &Table, path: &Path) -> Result<RunConfig> {
        let mapping_file_idx = table.require_column("mapping_file")?;
        let mapping_id_idx = table.require_column("mapping_id")?;
        let source_file_idx = table.require_column("source_file")?;
        let source_id_idx = table.require_column("source_id")?;
        let id_type_idx = table.column_index("id_type");
        let context_idx = table.column_index("source_context");
        let processed_idx = table.column_index("processed");

        let mut rows = Vec::new();
        for row_no in 0..table.rows.len() {
            let processed_raw = processed_idx
                .map(|i| table.cell(row_no, i).trim())
                .unwrap_or("");
            let processed = match processed_raw {
                PROCESSED_TRUE => true,
                PROCESSED_FALSE | "" => false,
                other => {
                    // Anything else risks silently re-hashing an already
                    // processed file, so the whole run refuses to start.
                    return Err(IdrError::Config(format!(
                        "row {}: processed flag '{}' is not the literal True or False",
                        row_no + 2,
                        other
                    )));
                }
            };
            rows.push(ConfigRow {
                mapping_file: table.cell(row_no, mapping_file_idx).trim().to_string(),
                mapping_id: table.cell(row_no, mapping_id_idx).trim().to_string(),
                source_file: table.cell(row_no, source_file_idx).trim().to_string(),
                source_id: table.cell(row_no, source_id_idx).trim().to_string(),
                id_type: id_type_idx
                    .map(|i| table.cell(row_no, i).trim().to_string())
                    .unwrap_or_default(),
                source_context: context_idx
                    .map(|i| table.cell(row_no, i).to_string())
                    .unwrap_or_default(),
                processed,
                state: if processed {
                    RowState::Processed
                } else {
                    RowState::Unprocessed
                },
            });
        }
        Ok(RunConfig {
            path: path.to_path_buf(),
            rows,
        })
    }

    /// Unique mapping id columns configured for one mapping file, in
    /// configuration order.
    pub fn mapping_columns(&self, mapping_file: &str) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| r.mapping_file == mapping_file)
            .map(|r| r.mapping_id.clone())
            .filter(|c| !c.is_empty())
            .unique()
            .collect()
    }

    /// Serialize back with the full seven-column schema and current flags.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new(CONFIG_COLUMNS.iter().map(|c| c.to_string()).collect());
        for row in &self.rows {
            table.rows.push(vec![
                row.mapping_file.clone(),
                row.mapping_id.clone(),
                row.source_file.clone(),
                row.source_id.clone(),
                row.id_type.clone(),
                row.source_context.clone(),
                if row.processed {
                    PROCESSED_TRUE
                } else {
                    PROCESSED_FALSE
                }
                .to_string(),
            ]);
        }
        table
    }

    /// Explicit reset: clear every processed flag so files run again.
    pub fn reset(&mut self) {
        for row in &mut self.rows {
            row.processed = false;
            row.state = RowState::Unprocessed;
        }
    }
}
