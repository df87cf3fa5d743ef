//! Query filters over conflict records

use crate::{
    start_of_day, ConflictRecord, ConflictSeverity, ConflictState, ConflictType, EntityRef,
    PurchaseOrderId, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Equality/range filter for listing conflicts.
///
/// Empty vectors match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictFilter {
    pub states: Vec<ConflictState>,
    pub severities: Vec<ConflictSeverity>,
    pub conflict_types: Vec<ConflictType>,
    pub purchase_order_ids: Vec<PurchaseOrderId>,
    pub subject: Option<EntityRef>,
    /// Matches conflicts never digested or last digested before this instant.
    pub digest_not_sent_since: Option<Timestamp>,
}

impl ConflictFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active (non-resolved) conflicts of one type against one subject.
    pub fn active_for(subject: EntityRef, conflict_type: ConflictType) -> Self {
        Self {
            states: ConflictState::ACTIVE.to_vec(),
            conflict_types: vec![conflict_type],
            subject: Some(subject),
            ..Self::default()
        }
    }

    /// Open/review low/medium conflicts not yet digested today (UTC).
    pub fn digest_candidates(now: Timestamp) -> Self {
        Self {
            states: ConflictState::DIGESTIBLE.to_vec(),
            severities: ConflictSeverity::DIGESTIBLE.to_vec(),
            digest_not_sent_since: Some(start_of_day(now)),
            ..Self::default()
        }
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = ConflictState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = ConflictType>) -> Self {
        self.conflict_types = types.into_iter().collect();
        self
    }

    pub fn with_purchase_orders(
        mut self,
        ids: impl IntoIterator<Item = PurchaseOrderId>,
    ) -> Self {
        self.purchase_order_ids = ids.into_iter().collect();
        self
    }

    pub fn matches(&self, conflict: &ConflictRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&conflict.state) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&conflict.severity) {
            return false;
        }
        if !self.conflict_types.is_empty() && !self.conflict_types.contains(&conflict.conflict_type)
        {
            return false;
        }
        if !self.purchase_order_ids.is_empty()
            && !self.purchase_order_ids.contains(&conflict.purchase_order_id)
        {
            return false;
        }
        if let Some(subject) = self.subject {
            if conflict.subject() != Some(subject) {
                return false;
            }
        }
        if let Some(cutoff) = self.digest_not_sent_since {
            if matches!(conflict.digest_sent_at, Some(sent) if sent >= cutoff) {
                return false;
            }
        }
        true
    }
}
