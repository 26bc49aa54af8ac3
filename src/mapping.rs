//! Mapping Table Loader/Normalizer - builds the in-memory identity relation

use crate::error::{IdrError, Result};
use crate::resolver::candidate_order;
use crate::table::Table;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical marker for an absent source context. Empty cells and NaN-like
/// spellings all normalize to this so lookup keys stay format-stable.
pub const EMPTY_CONTEXT: &str = "";

/// Priority used when the mapping table leaves the cell empty: lowest
/// precedence, so explicitly prioritized entities always win a conflict.
pub const DEFAULT_PRIORITY: u32 = u32::MAX;

/// Consent values accepted from mapping tables. Anything else is a per-row
/// validation diagnostic, never a silent coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Granted,
    Revoked,
    None,
}

impl ConsentStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "granted" => Some(ConsentStatus::Granted),
            "revoked" => Some(ConsentStatus::Revoked),
            "none" => Some(ConsentStatus::None),
            _ => Option::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStatus::Granted => "granted",
            ConsentStatus::Revoked => "revoked",
            ConsentStatus::None => "none",
        }
    }
}

/// Normalize a context cell: trimmed, with empty and NaN-like values
/// collapsing to the canonical empty marker.
pub fn normalize_context(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        EMPTY_CONTEXT.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Index key: an identifier value is unique within (id_type, context).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub id_type: String,
    pub context: String,
    pub id_value: String,
}

impl LookupKey {
    pub fn new(id_value: &str, id_type: &str, context: &str) -> Self {
        Self {
            id_type: id_type.trim().to_string(),
            context: normalize_context(context),
            id_value: id_value.trim().to_string(),
        }
    }
}

/// One identifier observation attributed to an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub id_value: String,
    pub id_type: String,
    pub context: String,
}

/// An entity as assembled from the mapping table.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub entity_id: String,
    pub consent: ConsentStatus,
    pub priority: u32,
    pub effective_date: Option<NaiveDate>,
    pub observations: Vec<Observation>,
}

/// Schema variant, decided once per mapping file and never re-checked per row.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingSchema {
    /// Implicit entities by row co-occurrence over the named id columns.
    Legacy { id_columns: Vec<String> },
    /// Explicit person_id rows with context/priority/consent/date columns.
    Enhanced,
}

impl MappingSchema {
    /// Enhanced if the table carries the explicit entity columns, else legacy
    /// over the configured mapping id columns.
    pub fn detect(table: &Table, id_columns: &[String]) -> Self {
        if table.has_column("person_id") && table.has_column("id_value") {
            MappingSchema::Enhanced
        } else {
            MappingSchema::Legacy {
                id_columns: id_columns.to_vec(),
            }
        }
    }
}

/// Per-row load problem; the row is skipped and the load continues.
#[derive(Debug, Clone, Serialize)]
pub struct LoadDiagnostic {
    /// 1-based file line (header is line 1).
    pub row: usize,
    pub message: String,
}

/// A conflict that was resolved deterministically but deserves audit.
#[derive(Debug, Clone, Serialize)]
pub struct Ambiguity {
    pub subject: String,
    pub detail: String,
}

/// The normalized identity relation: entity records plus an index from
/// (id_type, context, id_value) to candidate owners. Candidate lists are
/// kept in resolution order, best candidate first.
#[derive(Debug, Default)]
pub struct IdentityRelation {
    entities: HashMap<String, EntityRecord>,
    index: HashMap<LookupKey, Vec<String>>,
    pub diagnostics: Vec<LoadDiagnostic>,
    pub ambiguities: Vec<Ambiguity>,
}

impl IdentityRelation {
    pub fn load(table: &Table, schema: &MappingSchema) -> Result<IdentityRelation> {
        match schema {
            MappingSchema::Enhanced => Self::load_enhanced(table),
            MappingSchema::Legacy { id_columns } => Self::load_legacy(table, id_columns),
        }
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityRecord> {
        self.entities.get(entity_id)
    }

    /// Candidate owners for a lookup key, best first. Empty when unknown.
    pub fn candidates(&self, key: &LookupKey) -> &[String] {
        self.index.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of distinct entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn load_enhanced(table: &Table) -> Result<IdentityRelation> {
        let person_idx = table.require_column("person_id")?;
        let value_idx = table.require_column("id_value")?;
        let type_idx = table.require_column("id_type")?;
        let consent_idx = table.require_column("consent_status")?;
        let context_idx = table.column_index("source_context");
        let priority_idx = table.column_index("priority");
        let date_idx = table.column_index("effective_date");

        let mut relation = IdentityRelation::default();

        for row_no in 0..table.rows.len() {
            let line = row_no + 2;
            let person_id = table.cell(row_no, person_idx).trim().to_string();
            let id_value = table.cell(row_no, value_idx).trim().to_string();
            if person_id.is_empty() || id_value.is_empty() {
                relation.diagnostics.push(LoadDiagnostic {
                    row: line,
                    message: "missing person_id or id_value".to_string(),
                });
                continue;
            }
            let id_type = table.cell(row_no, type_idx).trim().to_string();
            if id_type.is_empty() {
                relation.diagnostics.push(LoadDiagnostic {
                    row: line,
                    message: "missing id_type".to_string(),
                });
                continue;
            }
            let consent_raw = table.cell(row_no, consent_idx);
            let consent = match ConsentStatus::parse(consent_raw) {
                Some(c) => c,
                Option::None => {
                    relation.diagnostics.push(LoadDiagnostic {
                        row: line,
                        message: format!(
                            "consent_status '{}' is not one of granted/revoked/none",
                            consent_raw.trim()
                        ),
                    });
                    continue;
                }
            };
            let context =
                normalize_context(context_idx.map(|i| table.cell(row_no, i)).unwrap_or(""));
            let priority_raw = priority_idx
                .map(|i| table.cell(row_no, i).trim())
                .unwrap_or("");
            let priority = if priority_raw.is_empty() || priority_raw.eq_ignore_ascii_case("nan") {
                DEFAULT_PRIORITY
            } else {
                match priority_raw.parse::<u32>() {
                    Ok(p) => p,
                    Err(_) => {
                        relation.diagnostics.push(LoadDiagnostic {
                            row: line,
                            message: format!("priority '{}' is not a positive integer", priority_raw),
                        });
                        continue;
                    }
                }
            };
            let date_raw = date_idx.map(|i| table.cell(row_no, i).trim()).unwrap_or("");
            let effective_date = if date_raw.is_empty() || date_raw.eq_ignore_ascii_case("nan") {
                Option::None
            } else {
                match NaiveDate::parse_from_str(date_raw, "%Y-%m-%d") {
                    Ok(d) => Some(d),
                    Err(_) => {
                        relation.diagnostics.push(LoadDiagnostic {
                            row: line,
                            message: format!("effective_date '{}' is not YYYY-MM-DD; ignored", date_raw),
                        });
                        Option::None
                    }
                }
            };

            let observation = Observation {
                id_value: id_value.clone(),
                id_type: id_type.clone(),
                context: context.clone(),
            };

            let entry = relation
                .entities
                .entry(person_id.clone())
                .or_insert_with(|| EntityRecord {
                    entity_id: person_id.clone(),
                    consent,
                    priority,
                    effective_date,
                    observations: Vec::new(),
                });
            if entry.consent != consent {
                relation.ambiguities.push(Ambiguity {
                    subject: person_id.clone(),
                    detail: format!(
                        "rows disagree on consent_status ({} vs {}); keeping the first",
                        entry.consent.as_str(),
                        consent.as_str()
                    ),
                });
            }
            // Precedence attributes take the strongest value seen for the
            // entity, independent of row order.
            if priority < entry.priority {
                entry.priority = priority;
            }
            if effective_date > entry.effective_date {
                entry.effective_date = effective_date;
            }
            if !entry.observations.contains(&observation) {
                entry.observations.push(observation);
            }

            let key = LookupKey::new(&id_value, &id_type, &context);
            let candidates = relation.index.entry(key).or_default();
            if !candidates.contains(&person_id) {
                candidates.push(person_id.clone());
            }
        }

        relation.finalize_conflicts();
        Ok(relation)
    }

    fn load_legacy(table: &Table, id_columns: &[String]) -> Result<IdentityRelation> {
        if id_columns.is_empty() {
            return Err(IdrError::Schema(
                "no mapping id columns configured for legacy mapping table".to_string(),
            ));
        }
        let mut column_indexes = Vec::new();
        for column in id_columns {
            column_indexes.push((column.clone(), table.require_column(column)?));
        }
        let consent_idx = table.column_index("consent_status");

        let mut relation = IdentityRelation::default();
        let mut first_consent: HashMap<String, ConsentStatus> = HashMap::new();

        for row_no in 0..table.rows.len() {
            let line = row_no + 2;
            let mut ids_in_row: Vec<(String, String)> = Vec::new();
            for (column, idx) in &column_indexes {
                let raw = table.cell(row_no, *idx).trim();
                if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
                    continue;
                }
                ids_in_row.push((column.clone(), raw.to_string()));
            }
            if ids_in_row.is_empty() {
                relation.diagnostics.push(LoadDiagnostic {
                    row: line,
                    message: "row has no identifier values".to_string(),
                });
                continue;
            }

            // The consent column is optional in the legacy schema; a missing
            // column or empty cell reads as granted, matching the behavior
            // the legacy files were written against.
            let row_consent = match consent_idx {
                Some(idx) => {
                    let raw = table.cell(row_no, idx);
                    if raw.trim().is_empty() {
                        ConsentStatus::Granted
                    } else {
                        match ConsentStatus::parse(raw) {
                            Some(c) => c,
                            Option::None => {
                                relation.diagnostics.push(LoadDiagnostic {
                                    row: line,
                                    message: format!(
                                        "consent_status '{}' is not one of granted/revoked/none",
                                        raw.trim()
                                    ),
                                });
                                continue;
                            }
                        }
                    }
                }
                Option::None => ConsentStatus::Granted,
            };

            // Entity identity for a legacy row is its first identifier value.
            let entity_id = ids_in_row[0].1.clone();
            let consent = match first_consent.get(&entity_id).copied() {
                Some(first) => {
                    if first != row_consent {
                        relation.ambiguities.push(Ambiguity {
                            subject: entity_id.clone(),
                            detail: format!(
                                "duplicate mapping rows disagree on consent_status ({} vs {}); keeping the first",
                                first.as_str(),
                                row_consent.as_str()
                            ),
                        });
                    }
                    first
                }
                Option::None => {
                    first_consent.insert(entity_id.clone(), row_consent);
                    row_consent
                }
            };

            let entry = relation
                .entities
                .entry(entity_id.clone())
                .or_insert_with(|| EntityRecord {
                    entity_id: entity_id.clone(),
                    consent,
                    priority: DEFAULT_PRIORITY,
                    effective_date: Option::None,
                    observations: Vec::new(),
                });
            for (id_type, id_value) in &ids_in_row {
                let observation = Observation {
                    id_value: id_value.clone(),
                    id_type: id_type.clone(),
                    context: EMPTY_CONTEXT.to_string(),
                };
                if !entry.observations.contains(&observation) {
                    entry.observations.push(observation);
                }
            }

            for (id_type, id_value) in &ids_in_row {
                let key = LookupKey::new(id_value, id_type, EMPTY_CONTEXT);
                let candidates = relation.index.entry(key).or_default();
                if !candidates.contains(&entity_id) {
                    candidates.push(entity_id.clone());
                }
            }
        }

        relation.finalize_conflicts();
        Ok(relation)
    }

    /// Order multi-candidate keys by the resolution total order and flag the
    /// keys whose winner is decided by entity id alone.
    fn finalize_conflicts(&mut self) {
        let entities = &self.entities;
        for (key, candidates) in self.index.iter_mut() {
            if candidates.len() < 2 {
                continue;
            }
            candidates.sort_by(|a, b| match (entities.get(a), entities.get(b)) {
                (Some(ea), Some(eb)) => candidate_order(ea, eb),
                _ => a.cmp(b),
            });
            if let (Some(best), Some(next)) = (
                entities.get(&candidates[0]),
                entities.get(&candidates[1]),
            ) {
                if best.priority == next.priority && best.effective_date == next.effective_date {
                    self.ambiguities.push(Ambiguity {
                        subject: format!("{}/{}/{}", key.id_type, key.context, key.id_value),
                        detail: format!(
                            "claimed by {} entities with equal priority and effective_date; resolved to {}",
                            candidates.len(),
                            candidates[0]
                        ),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enhanced_table(rows: Vec<Vec<&str>>) -> Table {
        let headers = [
            "person_id",
            "id_value",
            "id_type",
            "source_context",
            "priority",
            "consent_status",
            "effective_date",
            "notes",
        ];
        Table {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    fn legacy_table(headers: &[&str], rows: Vec<Vec<&str>>) -> Table {
        Table {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
        }
    }

    #[test]
    fn test_enhanced_load_builds_entity_and_index() {
        let table = enhanced_table(vec![
            vec!["PERSON_001", "2", "mobi_id", "study_main", "1", "granted", "2024-01-01", ""],
            vec!["PERSON_001", "DD-0100-6247", "mrn", "study_main", "1", "granted", "2024-01-01", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        assert_eq!(relation.len(), 1);
        let entity = relation.entity("PERSON_001").unwrap();
        assert_eq!(entity.consent, ConsentStatus::Granted);
        assert_eq!(entity.observations.len(), 2);

        let key = LookupKey::new("2", "mobi_id", "study_main");
        assert_eq!(relation.candidates(&key), ["PERSON_001"]);
    }

    #[test]
    fn test_context_empty_and_nan_normalize_to_one_key() {
        assert_eq!(normalize_context(""), EMPTY_CONTEXT);
        assert_eq!(normalize_context("   "), EMPTY_CONTEXT);
        assert_eq!(normalize_context("nan"), EMPTY_CONTEXT);
        assert_eq!(normalize_context("NaN"), EMPTY_CONTEXT);
        assert_eq!(normalize_context(" study_main "), "study_main");

        let with_empty = LookupKey::new("2", "mobi_id", "");
        let with_nan = LookupKey::new("2", "mobi_id", "NaN");
        assert_eq!(with_empty, with_nan);
    }

    #[test]
    fn test_invalid_consent_is_a_row_diagnostic_not_a_coercion() {
        let table = enhanced_table(vec![
            vec!["PERSON_001", "2", "mobi_id", "", "1", "maybe", "", ""],
            vec!["PERSON_002", "3", "mobi_id", "", "1", "granted", "", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        assert!(relation.entity("PERSON_001").is_none());
        assert!(relation.entity("PERSON_002").is_some());
        assert_eq!(relation.diagnostics.len(), 1);
        assert!(relation.diagnostics[0].message.contains("maybe"));
    }

    #[test]
    fn test_malformed_row_is_skipped_not_fatal() {
        let table = enhanced_table(vec![
            vec!["", "2", "mobi_id", "", "1", "granted", "", ""],
            vec!["PERSON_002", "3", "mobi_id", "", "1", "granted", "", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();
        assert_eq!(relation.len(), 1);
        assert_eq!(relation.diagnostics.len(), 1);
        assert_eq!(relation.diagnostics[0].row, 2);
    }

    #[test]
    fn test_missing_required_column_is_a_schema_error() {
        let table = legacy_table(&["person_id", "id_value"], vec![]);
        let err = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap_err();
        assert!(matches!(err, IdrError::Schema(_)));
    }

    #[test]
    fn test_cross_context_collision_is_two_entities() {
        let table = enhanced_table(vec![
            vec!["PERSON_001", "2", "mobi_id", "study_main", "1", "granted", "", ""],
            vec!["PERSON_002", "2", "mobi_id", "study_secondary", "1", "revoked", "", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        let main = LookupKey::new("2", "mobi_id", "study_main");
        let secondary = LookupKey::new("2", "mobi_id", "study_secondary");
        assert_eq!(relation.candidates(&main), ["PERSON_001"]);
        assert_eq!(relation.candidates(&secondary), ["PERSON_002"]);
        assert!(relation.ambiguities.is_empty());
    }

    #[test]
    fn test_same_context_conflict_resolved_by_priority() {
        let table = enhanced_table(vec![
            vec!["PERSON_001", "2", "mobi_id", "study_main", "5", "granted", "", ""],
            vec!["PERSON_002", "2", "mobi_id", "study_main", "1", "granted", "", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        let key = LookupKey::new("2", "mobi_id", "study_main");
        assert_eq!(relation.candidates(&key)[0], "PERSON_002");
        assert!(relation.ambiguities.is_empty());
    }

    #[test]
    fn test_priority_tie_broken_by_latest_effective_date() {
        let table = enhanced_table(vec![
            vec!["PERSON_001", "2", "mobi_id", "study_main", "1", "granted", "2023-06-01", ""],
            vec!["PERSON_002", "2", "mobi_id", "study_main", "1", "granted", "2024-06-01", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        let key = LookupKey::new("2", "mobi_id", "study_main");
        assert_eq!(relation.candidates(&key)[0], "PERSON_002");
        assert!(relation.ambiguities.is_empty());
    }

    #[test]
    fn test_unresolved_tie_is_flagged_and_deterministic() {
        let table = enhanced_table(vec![
            vec!["PERSON_B", "2", "mobi_id", "study_main", "1", "granted", "2024-06-01", ""],
            vec!["PERSON_A", "2", "mobi_id", "study_main", "1", "granted", "2024-06-01", ""],
        ]);
        let relation = IdentityRelation::load(&table, &MappingSchema::Enhanced).unwrap();

        let key = LookupKey::new("2", "mobi_id", "study_main");
        assert_eq!(relation.candidates(&key)[0], "PERSON_A");
        assert_eq!(relation.ambiguities.len(), 1);
    }

    #[test]
    fn test_schema_detection_dispatches_once() {
        let enhanced = enhanced_table(vec![]);
        assert_eq!(MappingSchema::detect(&enhanced, &[]), MappingSchema::Enhanced);

        let legacy = legacy_table(&["mobi_id", "MRN"], vec![]);
        let columns = vec!["mobi_id".to_string(), "MRN".to_string()];
        assert_eq!(
            MappingSchema::detect(&legacy, &columns),
            MappingSchema::Legacy { id_columns: columns.clone() }
        );
    }

    #[test]
    fn test_legacy_row_co_occurrence_forms_one_entity() {
        let table = legacy_table(
            &["mobi_id", "MRN"],
            vec![vec!["MB001", "M001"], vec!["MB002", "M002"]],
        );
        let schema = MappingSchema::Legacy {
            id_columns: vec!["mobi_id".to_string(), "MRN".to_string()],
        };
        let relation = IdentityRelation::load(&table, &schema).unwrap();

        assert_eq!(relation.len(), 2);
        let entity = relation.entity("MB001").unwrap();
        assert_eq!(entity.consent, ConsentStatus::Granted);
        assert_eq!(entity.observations.len(), 2);

        let mrn_key = LookupKey::new("M001", "MRN", "");
        assert_eq!(relation.candidates(&mrn_key), ["MB001"]);
        let mobi_key = LookupKey::new("MB001", "mobi_id", "");
        assert_eq!(relation.candidates(&mobi_key), ["MB001"]);
    }

    #[test]
    fn test_legacy_duplicate_rows_with_conflicting_consent() {
        let table = legacy_table(
            &["MRN", "consent_status"],
            vec![vec!["M001", "granted"], vec!["M001", "revoked"]],
        );
        let schema = MappingSchema::Legacy {
            id_columns: vec!["MRN".to_string()],
        };
        let relation = IdentityRelation::load(&table, &schema).unwrap();

        assert_eq!(relation.entity("M001").unwrap().consent, ConsentStatus::Granted);
        assert_eq!(relation.ambiguities.len(), 1);
        assert!(relation.ambiguities[0].detail.contains("keeping the first"));
    }
}
