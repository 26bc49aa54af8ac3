//! Resolution Engine - one resolution pass over a source file's rows

use crate::error::{IdrError, Result};
use crate::ledger::LookupLedger;
use crate::mapping::{normalize_context, IdentityRelation};
use crate::resolver::{ConflictResolver, ResolutionAudit, ResolutionOutcome};
use crate::table::Table;
use tracing::debug;

/// Column binding for one source file, from its configuration row.
#[derive(Debug, Clone)]
pub struct ColumnBinding {
    /// Identifier column in the source file.
    pub source_column: String,
    /// Identifier type the column holds.
    pub id_type: String,
    /// File-specific context; never a global default.
    pub context: String,
}

/// One source row annotated with its resolved consent label.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedRow {
    pub cells: Vec<String>,
    pub consent_label: String,
}

/// Output of a per-file resolution pass.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    /// Every source row, values untouched, in source order.
    pub annotated: Vec<AnnotatedRow>,
    /// Granted rows only, identifier cell replaced by the entity token.
    pub training: Vec<Vec<String>>,
    pub audit: Vec<ResolutionAudit>,
}

pub struct ResolutionEngine<'a> {
    relation: &'a IdentityRelation,
}

impl<'a> ResolutionEngine<'a> {
    pub fn new(relation: &'a IdentityRelation) -> Self {
        Self { relation }
    }

    /// Resolve every row of a source table against the identity relation.
    /// Unknown identifiers flow through with the sentinel label; only
    /// granted rows reach the training output, with the identifier replaced
    /// by the entity's ledger token.
    pub fn process(
        &self,
        ledger: &mut LookupLedger,
        source: &Table,
        binding: &ColumnBinding,
    ) -> Result<ProcessOutput> {
        let id_idx = source.column_index(&binding.source_column).ok_or_else(|| {
            IdrError::Schema(format!(
                "column '{}' not found in source table",
                binding.source_column
            ))
        })?;
        let context = normalize_context(&binding.context);

        let mut resolver = ConflictResolver::new(self.relation);
        let mut output = ProcessOutput::default();

        for row in &source.rows {
            let raw_value = row.get(id_idx).map(|c| c.as_str()).unwrap_or("");
            let outcome = resolver.resolve(raw_value, &binding.id_type, &context);

            output.annotated.push(AnnotatedRow {
                cells: row.clone(),
                consent_label: outcome.consent_label().to_string(),
            });

            if let ResolutionOutcome::Resolved { entity_id, .. } = &outcome {
                if outcome.is_granted() {
                    if let Some(entity) = self.relation.entity(entity_id) {
                        let token = ledger.token_or_assign(entity);
                        let mut cells = row.clone();
                        while cells.len() <= id_idx {
                            cells.push(String::new());
                        }
                        cells[id_idx] = token;
                        output.training.push(cells);
                    }
                }
            }
        }

        output.audit = resolver.into_audit();
        debug!(
            "resolution pass: {} rows, {} training rows, {} audited conflicts",
            source.rows.len(),
            output.training.len(),
            output.audit.len()
        );
        Ok(output)
    }
}
