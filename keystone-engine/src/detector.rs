//! Shared read-classify-write steps of the conflict detectors.

use keystone_core::{
    ConflictId, ConflictRecord, ConflictSeverity, ConflictState, ConflictType, DeliveryReceiptId,
    EntityRef, KeystoneResult, ProjectId, PurchaseOrderId, ShipmentId, Timestamp,
};
use keystone_storage::{ConflictUpdate, Storage};
use serde::Serialize;

/// Three-tier classification: within tolerance, MEDIUM, or HIGH.
///
/// `value <= tolerance` is within tolerance; `value > high` is HIGH.
pub fn classify_tier<T: PartialOrd>(value: T, tolerance: T, high: T) -> Option<ConflictSeverity> {
    if value <= tolerance {
        None
    } else if value > high {
        Some(ConflictSeverity::High)
    } else {
        Some(ConflictSeverity::Medium)
    }
}

/// What a detector run did to the conflict store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorAction {
    Created,
    Updated,
    Unchanged,
    Resolved,
    /// No conflict existed and none was needed
    None,
}

impl DetectorAction {
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Resolved)
    }
}

/// Conflict a detector wants to exist.
#[derive(Debug, Clone)]
pub(crate) struct ConflictDraft {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub description: String,
    pub purchase_order_id: PurchaseOrderId,
    pub project_id: ProjectId,
    pub shipment_id: Option<ShipmentId>,
    pub delivery_receipt_id: Option<DeliveryReceiptId>,
}

impl ConflictDraft {
    fn into_record(self, now: Timestamp) -> ConflictRecord {
        ConflictRecord {
            conflict_id: ConflictId::now_v7(),
            conflict_type: self.conflict_type,
            severity: self.severity,
            state: ConflictState::Open,
            description: self.description,
            purchase_order_id: self.purchase_order_id,
            project_id: self.project_id,
            shipment_id: self.shipment_id,
            delivery_receipt_id: self.delivery_receipt_id,
            digest_sent_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }
}

/// Result of reconciling a draft with the store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Upserted {
    pub conflict_id: ConflictId,
    pub action: DetectorAction,
    pub previous_severity: Option<ConflictSeverity>,
}

/// Make the active conflict for `subject` match `draft`.
///
/// Inserts when none is active, updates severity and description in place
/// when the severity differs, and leaves it alone otherwise. A unique
/// violation on insert means a concurrent run won; the winner is re-read and
/// reconciled instead.
pub(crate) async fn upsert_conflict<S: Storage + ?Sized>(
    store: &S,
    subject: EntityRef,
    draft: ConflictDraft,
    now: Timestamp,
) -> KeystoneResult<Upserted> {
    if let Some(existing) = store.conflict_find_active(subject, draft.conflict_type).await? {
        return reconcile(store, existing, draft).await;
    }

    let record = draft.clone().into_record(now);
    match store.conflict_insert(&record).await {
        Ok(()) => Ok(Upserted {
            conflict_id: record.conflict_id,
            action: DetectorAction::Created,
            previous_severity: None,
        }),
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(subject = %subject, "Concurrent conflict insert, re-reading");
            match store.conflict_find_active(subject, draft.conflict_type).await? {
                Some(existing) => reconcile(store, existing, draft).await,
                None => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

async fn reconcile<S: Storage + ?Sized>(
    store: &S,
    existing: ConflictRecord,
    draft: ConflictDraft,
) -> KeystoneResult<Upserted> {
    if existing.severity == draft.severity {
        return Ok(Upserted {
            conflict_id: existing.conflict_id,
            action: DetectorAction::Unchanged,
            previous_severity: Some(existing.severity),
        });
    }
    store
        .conflict_update(
            existing.conflict_id,
            ConflictUpdate {
                severity: Some(draft.severity),
                description: Some(draft.description),
                ..ConflictUpdate::default()
            },
        )
        .await?;
    Ok(Upserted {
        conflict_id: existing.conflict_id,
        action: DetectorAction::Updated,
        previous_severity: Some(existing.severity),
    })
}

/// Resolve the active conflict of `conflict_type` against `subject`, if any.
pub(crate) async fn resolve_active<S: Storage + ?Sized>(
    store: &S,
    subject: EntityRef,
    conflict_type: ConflictType,
    now: Timestamp,
) -> KeystoneResult<Option<ConflictRecord>> {
    let Some(existing) = store.conflict_find_active(subject, conflict_type).await? else {
        return Ok(None);
    };
    store
        .conflict_update(existing.conflict_id, ConflictUpdate::resolve(now))
        .await?;
    Ok(Some(existing))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classify_tier_boundaries() {
        assert_eq!(classify_tier(2, 2, 5), None);
        assert_eq!(classify_tier(3, 2, 5), Some(ConflictSeverity::Medium));
        assert_eq!(classify_tier(5, 2, 5), Some(ConflictSeverity::Medium));
        assert_eq!(classify_tier(6, 2, 5), Some(ConflictSeverity::High));
        assert_eq!(classify_tier(10.0, 5.0, 10.0), Some(ConflictSeverity::Medium));
        assert_eq!(classify_tier(10.01, 5.0, 10.0), Some(ConflictSeverity::High));
    }

    #[test]
    fn test_equal_thresholds_skip_medium() {
        assert_eq!(classify_tier(4, 4, 4), None);
        assert_eq!(classify_tier(5, 4, 4), Some(ConflictSeverity::High));
    }

    proptest! {
        #[test]
        fn prop_classification_is_monotonic(
            tolerance in 0i64..20,
            extra in 0i64..20,
            value in 0i64..60,
        ) {
            let high = tolerance + extra;
            let here = classify_tier(value, tolerance, high);
            let next = classify_tier(value + 1, tolerance, high);
            prop_assert!(here <= next);
        }
    }
}
