//! Delay Detector
//!
//! Compares a shipment's required-on-site date with its declared or
//! carrier-confirmed arrival and keeps at most one active DELAY conflict per
//! shipment in line with the result.

use crate::detector::{classify_tier, resolve_active, upsert_conflict, ConflictDraft, DetectorAction};
use crate::thresholds::load_thresholds;
use keystone_core::{
    ConflictId, ConflictSeverity, ConflictType, DelayThresholds, EntityIdType, EntityType,
    KeystoneResult, PurchaseOrder, PurchaseOrderId, ShipmentId, StorageError, Timestamp,
};
use keystone_storage::{ShipmentUpdate, Storage};
use serde::Serialize;

/// Severity for a delay, or `None` when within tolerance.
pub fn classify_delay(delay_days: i64, thresholds: &DelayThresholds) -> Option<ConflictSeverity> {
    classify_tier(delay_days, thresholds.tolerance_days, thresholds.high_delay_days)
}

pub fn delay_description(delay_days: i64) -> String {
    format!("Shipment delayed by {} days past ROS", delay_days)
}

/// Outcome of one delay evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelayEvaluation {
    pub shipment_id: ShipmentId,
    /// `None` when the shipment lacks a ROS or arrival date
    pub delay_days: Option<i64>,
    pub severity: Option<ConflictSeverity>,
    /// Severity of the active conflict before this run
    pub previous_severity: Option<ConflictSeverity>,
    pub action: DetectorAction,
    /// Active conflict after this run
    pub conflict_id: Option<ConflictId>,
}

impl DelayEvaluation {
    /// HIGH conflict that is new or was just raised to HIGH.
    pub fn became_high(&self) -> bool {
        self.severity == Some(ConflictSeverity::High)
            && matches!(self.action, DetectorAction::Created | DetectorAction::Updated)
            && self.previous_severity != Some(ConflictSeverity::High)
    }
}

pub(crate) async fn owning_purchase_order<S: Storage + ?Sized>(
    store: &S,
    id: PurchaseOrderId,
) -> KeystoneResult<PurchaseOrder> {
    store.purchase_order_get(id).await?.ok_or_else(|| {
        StorageError::NotFound {
            entity_type: EntityType::PurchaseOrder,
            id: id.as_uuid(),
        }
        .into()
    })
}

/// Evaluate a shipment's delay and reconcile its DELAY conflict.
pub async fn evaluate_shipment_delay<S: Storage + ?Sized>(
    store: &S,
    shipment_id: ShipmentId,
    now: Timestamp,
) -> KeystoneResult<DelayEvaluation> {
    let shipment = store
        .shipment_get(shipment_id)
        .await?
        .ok_or(StorageError::NotFound {
            entity_type: EntityType::Shipment,
            id: shipment_id.as_uuid(),
        })?;
    let po = owning_purchase_order(store, shipment.purchase_order_id).await?;
    let thresholds = load_thresholds(store, Some(po.organization_id))
        .await
        .delay_thresholds();

    let mut evaluation = DelayEvaluation {
        shipment_id,
        delay_days: None,
        severity: None,
        previous_severity: None,
        action: DetectorAction::None,
        conflict_id: None,
    };

    let Some(delay_days) = shipment.delay_days() else {
        tracing::debug!(
            shipment_id = %shipment_id,
            "Shipment lacks ROS or arrival date, delay not evaluated"
        );
        return Ok(evaluation);
    };
    evaluation.delay_days = Some(delay_days);
    evaluation.severity = classify_delay(delay_days, &thresholds);

    let subject = shipment_id.entity_ref();
    match evaluation.severity {
        Some(severity) => {
            let draft = ConflictDraft {
                conflict_type: ConflictType::Delay,
                severity,
                description: delay_description(delay_days),
                purchase_order_id: po.purchase_order_id,
                project_id: po.project_id,
                shipment_id: Some(shipment_id),
                delivery_receipt_id: None,
            };
            let upserted = upsert_conflict(store, subject, draft, now).await?;
            evaluation.action = upserted.action;
            evaluation.previous_severity = upserted.previous_severity;
            evaluation.conflict_id = Some(upserted.conflict_id);

            if upserted.action.wrote() {
                tracing::info!(
                    shipment_id = %shipment_id,
                    conflict_id = %upserted.conflict_id,
                    delay_days,
                    severity = %severity,
                    action = ?upserted.action,
                    "Delay conflict recorded"
                );
            }
        }
        None => {
            if let Some(resolved) =
                resolve_active(store, subject, ConflictType::Delay, now).await?
            {
                evaluation.action = DetectorAction::Resolved;
                evaluation.previous_severity = Some(resolved.severity);
                tracing::info!(
                    shipment_id = %shipment_id,
                    conflict_id = %resolved.conflict_id,
                    delay_days,
                    "Delay conflict resolved"
                );
            }
        }
    }

    // The exception flag tracks HIGH severity in both directions.
    let is_exception = evaluation.severity == Some(ConflictSeverity::High);
    if shipment.is_exception != is_exception {
        store
            .shipment_update(
                shipment_id,
                ShipmentUpdate {
                    is_exception: Some(is_exception),
                    ..ShipmentUpdate::default()
                },
            )
            .await?;
    }

    Ok(evaluation)
}

/// Evaluate a shipment and return its active DELAY conflict, if any.
pub async fn check_and_create_delay_conflict<S: Storage + ?Sized>(
    store: &S,
    shipment_id: ShipmentId,
    now: Timestamp,
) -> KeystoneResult<Option<ConflictId>> {
    Ok(evaluate_shipment_delay(store, shipment_id, now).await?.conflict_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{ConfigValue, ConflictState, ThresholdConfigEntry};
    use keystone_storage::MockStorage;
    use keystone_test_utils::{date, fixtures::Fixture, ts};

    fn now() -> Timestamp {
        ts("2024-01-05T12:00:00Z")
    }

    #[tokio::test]
    async fn test_within_tolerance_creates_nothing() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 3)), None)
            .await
            .unwrap();

        let eval = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(eval.delay_days, Some(2));
        assert_eq!(eval.severity, None);
        assert_eq!(eval.action, DetectorAction::None);
        assert_eq!(store.conflict_count(), 0);
    }

    #[tokio::test]
    async fn test_medium_band_uses_eta_when_no_aos() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), None, Some(date(2024, 1, 6)))
            .await
            .unwrap();

        let eval = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(eval.delay_days, Some(5));
        assert_eq!(eval.severity, Some(ConflictSeverity::Medium));
        assert_eq!(eval.action, DetectorAction::Created);

        let stored = store.shipment_get(s.shipment_id).await.unwrap().unwrap();
        assert!(!stored.is_exception);
    }

    #[tokio::test]
    async fn test_high_sets_exception_and_is_idempotent() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 10)), None)
            .await
            .unwrap();

        let first = check_and_create_delay_conflict(&store, s.shipment_id, now())
            .await
            .unwrap()
            .unwrap();
        let second = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(second.conflict_id, Some(first));
        assert_eq!(second.action, DetectorAction::Unchanged);
        assert!(!second.became_high());
        assert_eq!(store.conflict_count(), 1);

        let conflict = store.conflict_get(first).await.unwrap().unwrap();
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert_eq!(conflict.description, "Shipment delayed by 9 days past ROS");
        assert_eq!(conflict.project_id, fx.project_id);
        assert!(store.shipment_get(s.shipment_id).await.unwrap().unwrap().is_exception);
    }

    #[tokio::test]
    async fn test_severity_change_updates_in_place() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 4)), None)
            .await
            .unwrap();
        let medium = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(medium.severity, Some(ConflictSeverity::Medium));

        store
            .shipment_update(
                s.shipment_id,
                ShipmentUpdate {
                    supplier_aos: Some(date(2024, 1, 12)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let high = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(high.action, DetectorAction::Updated);
        assert_eq!(high.conflict_id, medium.conflict_id);
        assert!(high.became_high());
        assert_eq!(store.conflict_count(), 1);
    }

    #[tokio::test]
    async fn test_downgrade_to_medium_clears_exception() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 10)), None)
            .await
            .unwrap();
        let high = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(high.severity, Some(ConflictSeverity::High));
        assert!(store.shipment_get(s.shipment_id).await.unwrap().unwrap().is_exception);

        store
            .shipment_update(
                s.shipment_id,
                ShipmentUpdate {
                    supplier_aos: Some(date(2024, 1, 5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let medium = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(medium.severity, Some(ConflictSeverity::Medium));
        assert_eq!(medium.action, DetectorAction::Updated);
        assert_eq!(medium.previous_severity, Some(ConflictSeverity::High));
        assert_eq!(medium.conflict_id, high.conflict_id);
        assert!(!store.shipment_get(s.shipment_id).await.unwrap().unwrap().is_exception);
    }

    #[tokio::test]
    async fn test_recovery_resolves_and_clears_exception() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 10)), None)
            .await
            .unwrap();
        let id = check_and_create_delay_conflict(&store, s.shipment_id, now())
            .await
            .unwrap()
            .unwrap();

        store
            .shipment_update(
                s.shipment_id,
                ShipmentUpdate {
                    supplier_aos: Some(date(2024, 1, 2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let eval = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(eval.action, DetectorAction::Resolved);
        assert_eq!(eval.conflict_id, None);

        let conflict = store.conflict_get(id).await.unwrap().unwrap();
        assert_eq!(conflict.state, ConflictState::Resolved);
        assert_eq!(conflict.resolved_at, Some(now()));
        assert!(!store.shipment_get(s.shipment_id).await.unwrap().unwrap().is_exception);
        assert_eq!(store.conflict_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_dates_not_evaluated() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let s = fx.shipment(&store, None, Some(date(2024, 2, 1)), None).await.unwrap();
        let writes = store.write_count();

        let eval = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(eval.delay_days, None);
        assert_eq!(eval.action, DetectorAction::None);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_missing_shipment_is_not_found() {
        let store = MockStorage::new();
        let result = check_and_create_delay_conflict(&store, ShipmentId::now_v7(), now()).await;
        keystone_test_utils::assertions::assert_not_found(&result, EntityType::Shipment);
    }

    #[tokio::test]
    async fn test_org_thresholds_apply() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        store
            .config_upsert(&ThresholdConfigEntry {
                organization_id: Some(fx.organization_id()),
                key: "delay_tolerance_days".to_string(),
                value: ConfigValue::Number(10.0),
                description: None,
                updated_at: now(),
            })
            .await
            .unwrap();
        let s = fx
            .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 10)), None)
            .await
            .unwrap();

        let eval = evaluate_shipment_delay(&store, s.shipment_id, now()).await.unwrap();
        assert_eq!(eval.severity, None);
    }
}
