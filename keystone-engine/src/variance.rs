//! Variance Detector
//!
//! Records a delivery confirmation and raises a QUANTITY_VARIANCE conflict
//! when declared and delivered quantities diverge beyond tolerance.

use crate::delay::owning_purchase_order;
use crate::detector::{classify_tier, upsert_conflict, ConflictDraft, DetectorAction};
use crate::thresholds::load_thresholds;
use keystone_core::{
    ConflictId, ConflictSeverity, ConflictType, DeliveryLineItem, DeliveryReceipt,
    DeliveryReceiptId, EntityIdType, EntityType, KeystoneResult, ShipmentId, StorageError,
    Timestamp, UserId, ValidationError, VarianceThresholds,
};
use keystone_storage::Storage;
use serde::{Deserialize, Serialize};

/// Percentage variance of one line (see [`DeliveryLineItem::variance_percent`]).
pub fn line_variance_percent(item: &DeliveryLineItem) -> f64 {
    item.variance_percent()
}

/// Receipt-level variance: the maximum line variance, 0 for no lines.
pub fn receipt_variance_percent(items: &[DeliveryLineItem]) -> f64 {
    items
        .iter()
        .map(line_variance_percent)
        .fold(0.0, f64::max)
}

/// Severity for a variance, or `None` when within tolerance.
pub fn classify_variance(
    variance_percent: f64,
    thresholds: &VarianceThresholds,
) -> Option<ConflictSeverity> {
    classify_tier(
        variance_percent,
        thresholds.variance_percent,
        thresholds.high_variance_percent,
    )
}

pub fn variance_description(variance_percent: f64) -> String {
    format!(
        "Delivered quantity differs from declared by {:.1}%",
        variance_percent
    )
}

/// Delivery confirmation submitted for a shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmDeliveryRequest {
    pub shipment_id: ShipmentId,
    pub received_by: Option<UserId>,
    pub line_items: Vec<DeliveryLineItem>,
    pub notes: Option<String>,
}

impl ConfirmDeliveryRequest {
    /// Reject empty confirmations and negative or non-finite quantities.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.line_items.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "line_items".to_string(),
            });
        }
        for (i, item) in self.line_items.iter().enumerate() {
            for (field, value) in [
                ("declared_quantity", item.declared_quantity),
                ("delivered_quantity", item.delivered_quantity),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(ValidationError::InvalidValue {
                        field: format!("line_items[{}].{}", i, field),
                        reason: format!("must be a finite, non-negative number, got {}", value),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a delivery confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryConfirmation {
    pub receipt_id: DeliveryReceiptId,
    pub variance_percent: f64,
    pub severity: Option<ConflictSeverity>,
    pub action: DetectorAction,
    pub conflict_id: Option<ConflictId>,
}

/// Record a delivery receipt and run the variance check against it.
pub async fn confirm_delivery<S: Storage + ?Sized>(
    store: &S,
    request: ConfirmDeliveryRequest,
    now: Timestamp,
) -> KeystoneResult<DeliveryConfirmation> {
    request.validate()?;

    let shipment = store
        .shipment_get(request.shipment_id)
        .await?
        .ok_or(StorageError::NotFound {
            entity_type: EntityType::Shipment,
            id: request.shipment_id.as_uuid(),
        })?;
    let po = owning_purchase_order(store, shipment.purchase_order_id).await?;
    let thresholds = load_thresholds(store, Some(po.organization_id))
        .await
        .variance_thresholds();

    let variance_percent = receipt_variance_percent(&request.line_items);
    let severity = classify_variance(variance_percent, &thresholds);

    // The conflict is written first so a failed upsert leaves no receipt behind.
    let receipt_id = DeliveryReceiptId::now_v7();
    let upserted = match severity {
        Some(severity) => {
            let draft = ConflictDraft {
                conflict_type: ConflictType::QuantityVariance,
                severity,
                description: variance_description(variance_percent),
                purchase_order_id: po.purchase_order_id,
                project_id: po.project_id,
                shipment_id: Some(shipment.shipment_id),
                delivery_receipt_id: Some(receipt_id),
            };
            Some(upsert_conflict(store, receipt_id.entity_ref(), draft, now).await?)
        }
        None => None,
    };

    let receipt = DeliveryReceipt {
        receipt_id,
        shipment_id: shipment.shipment_id,
        purchase_order_id: po.purchase_order_id,
        received_by: request.received_by,
        received_at: now,
        line_items: request.line_items,
        variance_percent,
        conflict_id: upserted.as_ref().map(|u| u.conflict_id),
        notes: request.notes,
    };
    store.delivery_receipt_insert(&receipt).await?;

    let mut confirmation = DeliveryConfirmation {
        receipt_id,
        variance_percent,
        severity,
        action: DetectorAction::None,
        conflict_id: None,
    };

    let (Some(severity), Some(upserted)) = (severity, upserted) else {
        tracing::debug!(
            receipt_id = %receipt_id,
            variance_percent,
            "Delivery within variance tolerance"
        );
        return Ok(confirmation);
    };

    tracing::info!(
        receipt_id = %receipt.receipt_id,
        shipment_id = %shipment.shipment_id,
        conflict_id = %upserted.conflict_id,
        variance_percent,
        severity = %severity,
        "Quantity variance conflict recorded"
    );

    confirmation.action = upserted.action;
    confirmation.conflict_id = Some(upserted.conflict_id);
    Ok(confirmation)
}
