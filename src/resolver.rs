//! Conflict Resolver - maps an observed identifier to its owning entity

use crate::mapping::{ConsentStatus, EntityRecord, IdentityRelation, LookupKey};
use serde::Serialize;
use std::cmp::Ordering;

/// Consent label carried by rows whose identifier has no known owner. A
/// sentinel value, not an error: unresolved identifiers still produce a row.
pub const ID_NOT_FOUND: &str = "ID not found";

/// Total order over conflicting candidates: priority ascending, then latest
/// effective_date, then entity_id. Resolution stays deterministic even when
/// priority and date tie.
pub fn candidate_order(a: &EntityRecord, b: &EntityRecord) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.effective_date.cmp(&a.effective_date))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
}

/// Outcome of resolving one observed identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    Resolved {
        entity_id: String,
        consent: ConsentStatus,
    },
    NotFound,
}

impl ResolutionOutcome {
    /// Label written into the consent_status output column.
    pub fn consent_label(&self) -> &str {
        match self {
            ResolutionOutcome::Resolved { consent, .. } => consent.as_str(),
            ResolutionOutcome::NotFound => ID_NOT_FOUND,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            ResolutionOutcome::Resolved {
                consent: ConsentStatus::Granted,
                ..
            }
        )
    }
}

/// Audit record for a lookup that matched more than one entity.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionAudit {
    pub id_value: String,
    pub id_type: String,
    pub context: String,
    pub candidates: Vec<String>,
    pub resolved_to: String,
}

pub struct ConflictResolver<'a> {
    relation: &'a IdentityRelation,
    audit: Vec<ResolutionAudit>,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(relation: &'a IdentityRelation) -> Self {
        Self {
            relation,
            audit: Vec::new(),
        }
    }

    /// Resolve an observed (value, type, context) to its owning entity. The
    /// context is the caller's file-specific binding, normalized exactly as
    /// the loader normalizes it, so lookups never bleed across contexts.
    /// Multi-candidate matches resolve to the best candidate and are
    /// recorded for audit rather than raised.
    pub fn resolve(&mut self, id_value: &str, id_type: &str, context: &str) -> ResolutionOutcome {
        let key = LookupKey::new(id_value, id_type, context);
        let candidates = self.relation.candidates(&key);
        let winner = match candidates.first() {
            Some(entity_id) => entity_id,
            None => return ResolutionOutcome::NotFound,
        };
        if candidates.len() > 1 {
            self.audit.push(ResolutionAudit {
                id_value: key.id_value.clone(),
                id_type: key.id_type.clone(),
                context: key.context.clone(),
                candidates: candidates.to_vec(),
                resolved_to: winner.clone(),
            });
        }
        match self.relation.entity(winner) {
            Some(entity) => ResolutionOutcome::Resolved {
                entity_id: entity.entity_id.clone(),
                consent: entity.consent,
            },
            None => ResolutionOutcome::NotFound,
        }
    }

    pub fn audit(&self) -> &[ResolutionAudit] {
        &self.audit
    }

    pub fn into_audit(self) -> Vec<ResolutionAudit> {
        self.audit
    }
}
