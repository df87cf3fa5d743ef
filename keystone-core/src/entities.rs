//! Core entity structures

use crate::{
    days_between, BoqItemId, ChangeOrderId, ChangeOrderStatus, ConflictId, ConflictSeverity,
    ConflictState, ConflictType, Date, DeliveryReceiptId, EntityIdType, EntityType,
    EscalationLevel, InvoiceId, InvoiceStatus, MilestoneId, NotificationId, NotificationType,
    OrganizationId, ProjectId, PurchaseOrderId, ShipmentId, ShipmentStatus, Timestamp, UserId,
    UserRole, AuditLogId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to an entity by type and ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, id: Uuid) -> Self {
        Self { entity_type, id }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

// ============================================================================
// TENANCY
// ============================================================================

/// Organization - the tenant boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub organization_id: OrganizationId,
    pub name: String,
    pub created_at: Timestamp,
}

/// Platform user belonging to one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub email: String,
    pub name: String,
    pub role: UserRole,
    pub is_active: bool,
}

/// Purchase order - owner of shipments, invoices, change orders and milestones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub purchase_order_id: PurchaseOrderId,
    pub organization_id: OrganizationId,
    pub project_id: ProjectId,
    pub po_number: String,
    pub supplier_name: Option<String>,
    pub created_at: Timestamp,
}

// ============================================================================
// LOGISTICS
// ============================================================================

/// Shipment - one logistics movement tied to a purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_id: ShipmentId,
    pub purchase_order_id: PurchaseOrderId,
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    /// Required-on-site date
    pub ros_date: Option<Date>,
    /// Supplier-declared arrival on site
    pub supplier_aos: Option<Date>,
    /// Carrier-confirmed ETA
    pub logistics_eta: Option<Date>,
    pub actual_delivery_date: Option<Date>,
    pub is_tracking_linked: bool,
    pub status: ShipmentStatus,
    pub is_exception: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Shipment {
    /// Arrival date used for delay detection: supplier AOS, else carrier ETA.
    pub fn expected_arrival(&self) -> Option<Date> {
        self.supplier_aos.or(self.logistics_eta)
    }

    /// Whole days the expected arrival lands after ROS, clamped at zero.
    ///
    /// `None` when either date is missing.
    pub fn delay_days(&self) -> Option<i64> {
        let ros = self.ros_date?;
        let arrival = self.expected_arrival()?;
        Some(days_between(ros, arrival).max(0))
    }
}

/// One BOQ line on a delivery confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLineItem {
    pub boq_item_id: BoqItemId,
    pub description: String,
    pub declared_quantity: f64,
    pub delivered_quantity: f64,
}

impl DeliveryLineItem {
    /// Percentage difference between declared and delivered quantity.
    ///
    /// A zero declaration counts as a full (100%) variance when anything was
    /// delivered, and as no variance otherwise.
    pub fn variance_percent(&self) -> f64 {
        if self.declared_quantity == 0.0 {
            return if self.delivered_quantity > 0.0 { 100.0 } else { 0.0 };
        }
        (self.declared_quantity - self.delivered_quantity).abs() / self.declared_quantity * 100.0
    }
}

/// Delivery confirmation for a shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub receipt_id: DeliveryReceiptId,
    pub shipment_id: ShipmentId,
    pub purchase_order_id: PurchaseOrderId,
    pub received_by: Option<UserId>,
    pub received_at: Timestamp,
    pub line_items: Vec<DeliveryLineItem>,
    /// Maximum line variance across all items
    pub variance_percent: f64,
    pub conflict_id: Option<ConflictId>,
    pub notes: Option<String>,
}

// ============================================================================
// CONFLICTS
// ============================================================================

/// Conflict - a detected discrepancy requiring human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub state: ConflictState,
    pub description: String,
    pub purchase_order_id: PurchaseOrderId,
    pub project_id: ProjectId,
    pub shipment_id: Option<ShipmentId>,
    pub delivery_receipt_id: Option<DeliveryReceiptId>,
    /// Last inclusion in a batched digest
    pub digest_sent_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl ConflictRecord {
    /// Entity the conflict is raised against.
    ///
    /// Delay conflicts belong to the shipment, variance conflicts to the
    /// delivery receipt that revealed them.
    pub fn subject(&self) -> Option<EntityRef> {
        match self.conflict_type {
            ConflictType::Delay => self.shipment_id.map(|id| id.entity_ref()),
            ConflictType::QuantityVariance => self.delivery_receipt_id.map(|id| id.entity_ref()),
        }
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Payload linking a notification back to what triggered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    pub entity: EntityRef,
    pub escalation_level: EscalationLevel,
    pub days_elapsed: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_ids: Vec<ConflictId>,
}

/// Alert shown in the notification center.
///
/// Addressed either to a single user or to every user holding a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: NotificationId,
    pub organization_id: OrganizationId,
    pub user_id: Option<UserId>,
    pub target_role: Option<UserRole>,
    pub notification_type: NotificationType,
    pub title: String,
    pub message: String,
    pub link: Option<String>,
    pub metadata: NotificationMetadata,
    pub created_at: Timestamp,
    pub read_at: Option<Timestamp>,
}

impl Notification {
    /// Storage-level uniqueness key: one notification per entity, level and UTC day.
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            entity: self.metadata.entity,
            level: self.metadata.escalation_level,
            day: self.created_at.date_naive(),
        }
    }
}

/// Uniqueness key for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupeKey {
    pub entity: EntityRef,
    pub level: EscalationLevel,
    pub day: Date,
}

// ============================================================================
// ESCALATION SUBJECTS
// ============================================================================

/// Supplier invoice awaiting approval or payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: InvoiceId,
    pub purchase_order_id: PurchaseOrderId,
    pub invoice_number: String,
    pub amount: f64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub due_date: Date,
    pub submitted_at: Timestamp,
    pub paid_at: Option<Timestamp>,
}

/// Change order against a purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOrder {
    pub change_order_id: ChangeOrderId,
    pub purchase_order_id: PurchaseOrderId,
    pub co_number: String,
    pub amount_delta: f64,
    pub status: ChangeOrderStatus,
    pub submitted_at: Option<Timestamp>,
}

/// Payment milestone on a purchase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone_id: MilestoneId,
    pub purchase_order_id: PurchaseOrderId,
    pub title: String,
    pub progress_percent: f64,
    /// When progress reached 100%
    pub completed_at: Option<Timestamp>,
    pub validated_at: Option<Timestamp>,
    pub expected_date: Option<Date>,
}

impl Milestone {
    /// Complete by progress but not yet validated by the PM.
    pub fn awaits_validation(&self) -> bool {
        self.progress_percent >= 100.0 && self.completed_at.is_some() && self.validated_at.is_none()
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// Append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub audit_id: AuditLogId,
    pub organization_id: OrganizationId,
    pub entity: EntityRef,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn date(y: i32, m: u32, d: u32) -> Date {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn shipment() -> Shipment {
        let now = Utc::now();
        Shipment {
            shipment_id: ShipmentId::now_v7(),
            purchase_order_id: PurchaseOrderId::now_v7(),
            carrier: None,
            tracking_number: None,
            ros_date: Some(date(2024, 1, 1)),
            supplier_aos: None,
            logistics_eta: None,
            actual_delivery_date: None,
            is_tracking_linked: false,
            status: ShipmentStatus::InTransit,
            is_exception: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn line(declared: f64, delivered: f64) -> DeliveryLineItem {
        DeliveryLineItem {
            boq_item_id: BoqItemId::now_v7(),
            description: "rebar".to_string(),
            declared_quantity: declared,
            delivered_quantity: delivered,
        }
    }

    #[test]
    fn test_expected_arrival_prefers_supplier_aos() {
        let mut s = shipment();
        s.logistics_eta = Some(date(2024, 1, 4));
        assert_eq!(s.expected_arrival(), Some(date(2024, 1, 4)));
        s.supplier_aos = Some(date(2024, 1, 10));
        assert_eq!(s.expected_arrival(), Some(date(2024, 1, 10)));
        assert_eq!(s.delay_days(), Some(9));
    }

    #[test]
    fn test_delay_days_clamps_early_arrival() {
        let mut s = shipment();
        s.logistics_eta = Some(date(2023, 12, 20));
        assert_eq!(s.delay_days(), Some(0));
    }

    #[test]
    fn test_delay_days_requires_both_dates() {
        let mut s = shipment();
        assert_eq!(s.delay_days(), None);
        s.ros_date = None;
        s.supplier_aos = Some(date(2024, 1, 3));
        assert_eq!(s.delay_days(), None);
    }

    #[test]
    fn test_variance_zero_declared() {
        assert_eq!(line(0.0, 5.0).variance_percent(), 100.0);
        assert_eq!(line(0.0, 0.0).variance_percent(), 0.0);
    }

    #[test]
    fn test_variance_over_and_under_delivery() {
        assert_eq!(line(100.0, 85.0).variance_percent(), 15.0);
        assert_eq!(line(100.0, 110.0).variance_percent(), 10.0);
    }

    #[test]
    fn test_conflict_subject_by_type() {
        let now = Utc::now();
        let shipment_id = ShipmentId::now_v7();
        let receipt_id = DeliveryReceiptId::now_v7();
        let mut conflict = ConflictRecord {
            conflict_id: ConflictId::now_v7(),
            conflict_type: ConflictType::Delay,
            severity: ConflictSeverity::High,
            state: ConflictState::Open,
            description: String::new(),
            purchase_order_id: PurchaseOrderId::now_v7(),
            project_id: ProjectId::now_v7(),
            shipment_id: Some(shipment_id),
            delivery_receipt_id: Some(receipt_id),
            digest_sent_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        assert_eq!(conflict.subject(), Some(shipment_id.entity_ref()));
        conflict.conflict_type = ConflictType::QuantityVariance;
        assert_eq!(conflict.subject(), Some(receipt_id.entity_ref()));
    }

    #[test]
    fn test_milestone_awaits_validation() {
        let mut m = Milestone {
            milestone_id: MilestoneId::now_v7(),
            purchase_order_id: PurchaseOrderId::now_v7(),
            title: "Foundations".to_string(),
            progress_percent: 100.0,
            completed_at: Some(Utc::now()),
            validated_at: None,
            expected_date: None,
        };
        assert!(m.awaits_validation());
        m.validated_at = Some(Utc::now());
        assert!(!m.awaits_validation());
        m.validated_at = None;
        m.progress_percent = 80.0;
        assert!(!m.awaits_validation());
    }
}
