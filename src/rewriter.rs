//! Consent-Gated Rewriter - annotated original and training extract

use crate::engine::ProcessOutput;
use crate::error::{IdrError, Result};
use crate::table::Table;
use std::path::{Path, PathBuf};

/// Column appended to (or refreshed in) the annotated original.
pub const CONSENT_COLUMN: &str = "consent_status";

/// Training extracts land beside the source as `<stem>_training.<ext>`.
pub fn training_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("csv");
    source.with_file_name(format!("{}_training.{}", stem, ext))
}

/// Apply resolution results to the original table. Pure transformation: row
/// order and every non-identifier cell carry over verbatim; persistence is
/// the caller's concern.
pub fn apply(original: &Table, output: &ProcessOutput) -> Result<(Table, Table)> {
    if original.rows.len() != output.annotated.len() {
        return Err(IdrError::Schema(format!(
            "annotated rows ({}) do not match source rows ({})",
            output.annotated.len(),
            original.rows.len()
        )));
    }

    let mut updated = Table::new(original.headers.clone());
    // A re-run after an explicit reset refreshes the existing column instead
    // of stacking a second one.
    let consent_idx = original.column_index(CONSENT_COLUMN);
    if consent_idx.is_none() {
        updated.headers.push(CONSENT_COLUMN.to_string());
    }
    for (row, annotated) in original.rows.iter().zip(&output.annotated) {
        let mut cells = row.clone();
        match consent_idx {
            Some(idx) => {
                while cells.len() <= idx {
                    cells.push(String::new());
                }
                cells[idx] = annotated.consent_label.clone();
            }
            None => cells.push(annotated.consent_label.clone()),
        }
        updated.rows.push(cells);
    }

    let training = Table {
        headers: original.headers.clone(),
        rows: output.training.clone(),
    };
    Ok((updated, training))
}
