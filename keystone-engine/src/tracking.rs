//! Carrier tracking ingestion.
//!
//! Carrier adapters (Maersk, DHL, AfterShip) normalize their payloads into a
//! [`TrackingUpdate`]. Ingestion applies it to the shipment, re-runs the delay
//! check and raises an immediate alert when a shipment turns HIGH.

use crate::constants::CONFLICTS_LINK;
use crate::delay::{evaluate_shipment_delay, DelayEvaluation};
use keystone_core::{
    dedupe_window_start, Carrier, ConflictId, Date, EntityIdType, EscalationLevel,
    KeystoneResult, Notification, NotificationId, NotificationMetadata, NotificationType,
    OrganizationId, ShipmentId, ShipmentStatus, Timestamp, UserRole,
};
use keystone_storage::{ShipmentUpdate, Storage};
use serde::{Deserialize, Serialize};

/// Carrier-neutral tracking event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingUpdate {
    pub shipment_id: ShipmentId,
    pub carrier: Carrier,
    pub tracking_number: Option<String>,
    pub status: Option<ShipmentStatus>,
    pub logistics_eta: Option<Date>,
    /// Carrier-confirmed delivery date
    pub delivered_on: Option<Date>,
    /// Carrier flagged the shipment as an exception
    pub exception: Option<bool>,
}

impl TrackingUpdate {
    fn to_shipment_update(&self) -> ShipmentUpdate {
        let status = match (self.status, self.delivered_on) {
            (Some(status), _) => Some(status),
            (None, Some(_)) => Some(ShipmentStatus::Delivered),
            (None, None) => None,
        };
        ShipmentUpdate {
            carrier: Some(self.carrier.as_db_str().to_string()),
            tracking_number: self.tracking_number.clone(),
            status,
            supplier_aos: None,
            // A confirmed delivery is the best arrival estimate there is
            logistics_eta: self.logistics_eta.or(self.delivered_on),
            actual_delivery_date: self.delivered_on,
            is_tracking_linked: Some(self.carrier != Carrier::Manual),
            is_exception: self.exception,
        }
    }
}

/// Acknowledgement returned to the carrier adapter. Always accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestAck {
    pub shipment_id: ShipmentId,
    pub accepted: bool,
    pub evaluation: Option<DelayEvaluation>,
    /// Whether a CONFLICT_ALERT was recorded by this update
    pub alerted: bool,
    pub error: Option<String>,
}

/// Apply a tracking update and run the delay check.
///
/// Never fails: processing errors are logged and carried in [`IngestAck::error`].
pub async fn ingest_tracking_update<S: Storage + ?Sized>(
    store: &S,
    update: TrackingUpdate,
    now: Timestamp,
) -> IngestAck {
    let shipment_id = update.shipment_id;
    let mut ack = IngestAck {
        shipment_id,
        accepted: true,
        evaluation: None,
        alerted: false,
        error: None,
    };

    match process(store, &update, now).await {
        Ok((evaluation, alerted)) => {
            ack.evaluation = Some(evaluation);
            ack.alerted = alerted;
        }
        Err(e) => {
            tracing::error!(
                shipment_id = %shipment_id,
                carrier = %update.carrier,
                error = %e,
                "Tracking update processing failed"
            );
            ack.error = Some(e.to_string());
        }
    }
    ack
}

async fn process<S: Storage + ?Sized>(
    store: &S,
    update: &TrackingUpdate,
    now: Timestamp,
) -> KeystoneResult<(DelayEvaluation, bool)> {
    store
        .shipment_update(update.shipment_id, update.to_shipment_update())
        .await?;
    let evaluation = evaluate_shipment_delay(store, update.shipment_id, now).await?;

    let mut alerted = false;
    if evaluation.became_high() {
        if let Some(conflict_id) = evaluation.conflict_id {
            let shipment = store.shipment_get(update.shipment_id).await?;
            let po = match shipment {
                Some(s) => store.purchase_order_get(s.purchase_order_id).await?,
                None => None,
            };
            if let Some(po) = po {
                alerted = alert_pms(store, po.organization_id, conflict_id, &evaluation, now).await?;
            }
        }
    }
    Ok((evaluation, alerted))
}

/// Record a CONFLICT_ALERT for the organization's PMs, once per conflict per day.
async fn alert_pms<S: Storage + ?Sized>(
    store: &S,
    organization_id: OrganizationId,
    conflict_id: ConflictId,
    evaluation: &DelayEvaluation,
    now: Timestamp,
) -> KeystoneResult<bool> {
    let entity = conflict_id.entity_ref();
    let level = EscalationLevel::Pm;
    if store
        .notification_exists_since(entity, level, dedupe_window_start(now))
        .await?
    {
        return Ok(false);
    }

    let days = evaluation.delay_days.unwrap_or_default();
    let notification = Notification {
        notification_id: NotificationId::now_v7(),
        organization_id,
        user_id: None,
        target_role: Some(UserRole::Pm),
        notification_type: NotificationType::ConflictAlert,
        title: "Critical shipment delay".to_string(),
        message: format!("Shipment {} is now {} days past ROS", evaluation.shipment_id, days),
        link: Some(format!("{}/{}", CONFLICTS_LINK, conflict_id)),
        metadata: NotificationMetadata {
            entity,
            escalation_level: level,
            days_elapsed: evaluation.delay_days,
            conflict_ids: vec![conflict_id],
        },
        created_at: now,
        read_at: None,
    };
    match store.notification_insert(&notification).await {
        Ok(()) => {
            tracing::info!(
                shipment_id = %evaluation.shipment_id,
                conflict_id = %conflict_id,
                "Immediate delay alert recorded"
            );
            Ok(true)
        }
        Err(e) if e.is_unique_violation() => Ok(false),
        Err(e) => Err(e),
    }
}
