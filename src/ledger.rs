//! Lookup Ledger - durable entity to hashed-token assignments

use crate::error::{IdrError, Result};
use crate::hasher::hash_entity;
use crate::mapping::{normalize_context, ConsentStatus, EntityRecord};
use crate::table::Table;
use serde::Serialize;
use std::collections::HashMap;

/// Default ledger file name, kept from earlier tool versions so existing
/// ledgers keep working.
pub const LEDGER_FILE_NAME: &str = "id_lookup_table.csv";

pub const LEDGER_COLUMNS: [&str; 7] = [
    "person_id",
    "original_id",
    "hashed_id",
    "id_type",
    "source_context",
    "consent_status",
    "from_mapping",
];

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub person_id: String,
    pub original_id: String,
    pub hashed_id: String,
    pub id_type: String,
    pub source_context: String,
    pub consent_status: ConsentStatus,
    pub from_mapping: bool,
}

/// Entity→token ledger. A token is assigned at most once per entity and the
/// assignment lands together with its entries or not at all; that single
/// method is also the critical section to guard if per-file processing ever
/// runs in parallel.
#[derive(Debug, Default)]
pub struct LookupLedger {
    entries: Vec<LedgerEntry>,
    tokens: HashMap<String, String>,
}

impl LookupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted ledger table.
    pub fn from_table(table: &Table) -> Result<Self> {
        let person_idx = table.require_column("person_id")?;
        let original_idx = table.require_column("original_id")?;
        let hashed_idx = table.require_column("hashed_id")?;
        let type_idx = table.column_index("id_type");
        let context_idx = table.column_index("source_context");
        let consent_idx = table.column_index("consent_status");
        let mapping_idx = table.column_index("from_mapping");

        let mut ledger = LookupLedger::new();
        for row_no in 0..table.rows.len() {
            let person_id = table.cell(row_no, person_idx).trim().to_string();
            let hashed_id = table.cell(row_no, hashed_idx).trim().to_string();
            if person_id.is_empty() || hashed_id.is_empty() {
                return Err(IdrError::Ledger(format!(
                    "row {} is missing person_id or hashed_id",
                    row_no + 2
                )));
            }
            if let Some(existing) = ledger.tokens.get(&person_id) {
                if existing != &hashed_id {
                    return Err(IdrError::Ledger(format!(
                        "two different tokens recorded for entity {}",
                        person_id
                    )));
                }
            }
            let consent_status = consent_idx
                .and_then(|i| ConsentStatus::parse(table.cell(row_no, i)))
                .unwrap_or(ConsentStatus::Granted);
            ledger.entries.push(LedgerEntry {
                person_id: person_id.clone(),
                original_id: table.cell(row_no, original_idx).to_string(),
                hashed_id: hashed_id.clone(),
                id_type: type_idx
                    .map(|i| table.cell(row_no, i).to_string())
                    .unwrap_or_default(),
                source_context: context_idx
                    .map(|i| normalize_context(table.cell(row_no, i)))
                    .unwrap_or_default(),
                consent_status,
                from_mapping: mapping_idx
                    .map(|i| table.cell(row_no, i).trim() == "True")
                    .unwrap_or(true),
            });
            ledger.tokens.insert(person_id, hashed_id);
        }
        Ok(ledger)
    }

    /// Token previously assigned to an entity, if any.
    pub fn token_for(&self, entity_id: &str) -> Option<&str> {
        self.tokens.get(entity_id).map(|s| s.as_str())
    }

    /// Lookup-else-insert-and-hash. An already-ledgered entity always keeps
    /// its existing token; a first assignment records the entity's full
    /// alias set from the mapping table in the same step.
    pub fn token_or_assign(&mut self, entity: &EntityRecord) -> String {
        if let Some(token) = self.tokens.get(&entity.entity_id) {
            return token.clone();
        }
        let token = hash_entity(&entity.entity_id);
        for observation in &entity.observations {
            self.entries.push(LedgerEntry {
                person_id: entity.entity_id.clone(),
                original_id: observation.id_value.clone(),
                hashed_id: token.clone(),
                id_type: observation.id_type.clone(),
                source_context: observation.context.clone(),
                consent_status: entity.consent,
                from_mapping: true,
            });
        }
        self.tokens.insert(entity.entity_id.clone(), token.clone());
        token
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize for persistence through a TableStore.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new(LEDGER_COLUMNS.iter().map(|c| c.to_string()).collect());
        for entry in &self.entries {
            table.rows.push(vec![
                entry.person_id.clone(),
                entry.original_id.clone(),
                entry.hashed_id.clone(),
                entry.id_type.clone(),
                entry.source_context.clone(),
                entry.consent_status.as_str().to_string(),
                if entry.from_mapping { "True" } else { "False" }.to_string(),
            ]);
        }
        table
    }
}
