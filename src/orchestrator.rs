//! Run Orchestrator - drives per-file resolution passes over a configuration

use crate::config::{ConfigRow, RowState, RunConfig};
use crate::engine::{ColumnBinding, ResolutionEngine};
use crate::error::{IdrError, Result};
use crate::ledger::{LookupLedger, LEDGER_FILE_NAME};
use crate::mapping::{IdentityRelation, MappingSchema};
use crate::rewriter;
use crate::table::{create_backup, find_file, TableStore};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Cooperative stop signal, checked between whole-file batches only, so a
/// file is either fully processed or left untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ledger location; defaults to `id_lookup_table.csv` beside the
    /// configuration file.
    pub ledger_path: Option<PathBuf>,
    /// Directory files are discovered under; defaults to the configuration
    /// file's directory.
    pub base_dir: Option<PathBuf>,
}

/// Per-file outcome in the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source_file: String,
    pub state: RowState,
    pub skipped: bool,
    pub rows: usize,
    pub training_rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub files: Vec<FileReport>,
    pub ledger_entries: usize,
    pub ambiguities: usize,
    pub diagnostics: usize,
}

struct RowOutcome {
    rows: usize,
    training_rows: usize,
    audited_conflicts: usize,
}

pub struct Orchestrator<'a> {
    store: &'a dyn TableStore,
    cancel: CancelToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn TableStore) -> Self {
        Self {
            store,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(store: &'a dyn TableStore, cancel: CancelToken) -> Self {
        Self { store, cancel }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Process every unprocessed configuration row, then persist the ledger
    /// and the updated flags. Per-file failures are reported and isolated,
    /// never fatal to the other files.
    pub fn run(&self, config_path: &Path, options: &RunOptions) -> Result<RunSummary> {
        let config_table = self.store.read_table(config_path)?;
        let mut config = RunConfig::load(&config_table, config_path)?;

        let base_dir = options.base_dir.clone().unwrap_or_else(|| {
            config_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let ledger_path = options
            .ledger_path
            .clone()
            .unwrap_or_else(|| base_dir.join(LEDGER_FILE_NAME));

        let mut ledger = if ledger_path.exists() {
            let loaded = LookupLedger::from_table(&self.store.read_table(&ledger_path)?)?;
            info!("loaded ledger with {} entries", loaded.len());
            loaded
        } else {
            LookupLedger::new()
        };

        // Mapping id columns per mapping file, needed before legacy loads.
        let mut mapping_columns: HashMap<String, Vec<String>> = HashMap::new();
        for row in &config.rows {
            if !mapping_columns.contains_key(&row.mapping_file) {
                let columns = config.mapping_columns(&row.mapping_file);
                mapping_columns.insert(row.mapping_file.clone(), columns);
            }
        }

        let mut relations: HashMap<String, IdentityRelation> = HashMap::new();
        let mut reports = Vec::new();
        let mut ambiguities = 0usize;

        for idx in 0..config.rows.len() {
            if self.cancel.is_cancelled() {
                info!("cancellation requested; remaining files left untouched");
                break;
            }

            let row = config.rows[idx].clone();
            if row.processed {
                info!("skipping {}: already processed", row.source_file);
                reports.push(FileReport {
                    source_file: row.source_file.clone(),
                    state: RowState::Processed,
                    skipped: true,
                    rows: 0,
                    training_rows: 0,
                    error: None,
                });
                continue;
            }

            config.rows[idx].state = RowState::InProgress;
            match self.process_row(&base_dir, &row, &mapping_columns, &mut relations, &mut ledger) {
                Ok(outcome) => {
                    config.rows[idx].processed = true;
                    config.rows[idx].state = RowState::Processed;
                    ambiguities += outcome.audited_conflicts;
                    info!(
                        "processed {}: {} rows, {} training rows",
                        row.source_file, outcome.rows, outcome.training_rows
                    );
                    reports.push(FileReport {
                        source_file: row.source_file.clone(),
                        state: RowState::Processed,
                        skipped: false,
                        rows: outcome.rows,
                        training_rows: outcome.training_rows,
                        error: None,
                    });
                }
                Err(err) => {
                    config.rows[idx].state = RowState::Failed;
                    error!("failed {}: {}", row.source_file, err);
                    reports.push(FileReport {
                        source_file: row.source_file.clone(),
                        state: RowState::Failed,
                        skipped: false,
                        rows: 0,
                        training_rows: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        let mut diagnostics = 0usize;
        for relation in relations.values() {
            ambiguities += relation.ambiguities.len();
            diagnostics += relation.diagnostics.len();
            for ambiguity in &relation.ambiguities {
                warn!("ambiguity {}: {}", ambiguity.subject, ambiguity.detail);
            }
            for diagnostic in &relation.diagnostics {
                warn!("mapping row {}: {}", diagnostic.row, diagnostic.message);
            }
        }

        self.store.write_table(&ledger_path, &ledger.to_table())?;
        self.store.write_table(config_path, &config.to_table())?;

        Ok(RunSummary {
            files: reports,
            ledger_entries: ledger.len(),
            ambiguities,
            diagnostics,
        })
    }

    fn process_row(
        &self,
        base_dir: &Path,
        row: &ConfigRow,
        mapping_columns: &HashMap<String, Vec<String>>,
        relations: &mut HashMap<String, IdentityRelation>,
        ledger: &mut LookupLedger,
    ) -> Result<RowOutcome> {
        let mapping_path = find_file(base_dir, &row.mapping_file)?;
        let source_path = find_file(base_dir, &row.source_file)?;
        if source_path == mapping_path {
            return Err(IdrError::Schema(format!(
                "source file {} is the mapping table; refusing to rewrite it",
                row.source_file
            )));
        }

        // The identity relation is built once per mapping file per run.
        if !relations.contains_key(&row.mapping_file) {
            let table = self.store.read_table(&mapping_path)?;
            let columns = mapping_columns
                .get(&row.mapping_file)
                .cloned()
                .unwrap_or_default();
            let schema = MappingSchema::detect(&table, &columns);
            let relation = IdentityRelation::load(&table, &schema)?;
            info!(
                "loaded mapping {} ({} entities)",
                row.mapping_file,
                relation.len()
            );
            relations.insert(row.mapping_file.clone(), relation);
        }
        let relation = match relations.get(&row.mapping_file) {
            Some(relation) => relation,
            None => {
                return Err(IdrError::Schema(format!(
                    "mapping {} is not loaded",
                    row.mapping_file
                )))
            }
        };

        let source = self.store.read_table(&source_path)?;
        let binding = ColumnBinding {
            source_column: row.source_id.clone(),
            id_type: row.effective_id_type().to_string(),
            context: row.source_context.clone(),
        };

        let engine = ResolutionEngine::new(relation);
        let output = engine.process(ledger, &source, &binding)?;
        for audit in &output.audit {
            warn!(
                "ambiguous identifier '{}' ({}, context '{}') matched {:?}; resolved to {}",
                audit.id_value, audit.id_type, audit.context, audit.candidates, audit.resolved_to
            );
        }

        let (updated, training) = rewriter::apply(&source, &output)?;

        create_backup(&source_path)?;
        self.store.write_table(&source_path, &updated)?;
        self.store
            .write_table(&rewriter::training_path(&source_path), &training)?;

        Ok(RowOutcome {
            rows: source.rows.len(),
            training_rows: training.rows.len(),
            audited_conflicts: output.audit.len(),
        })
    }
}
