//! Keystone Storage - Storage Trait and Mock Implementation
//!
//! Defines the persistence abstraction the conflict engine runs against.
//! The PostgreSQL implementation lives in keystone-engine (`db::PgStorage`).

mod mock;

pub use mock::MockStorage;

use ::async_trait::async_trait;
use keystone_core::{
    AuditLogEntry, ChangeOrder, ConflictFilter, ConflictId, ConflictRecord, ConflictSeverity,
    ConflictState, ConflictType, Date, DeliveryReceipt, DeliveryReceiptId, EntityRef,
    EscalationLevel, Invoice, InvoiceId, InvoiceStatus, KeystoneResult, Milestone, Notification,
    Organization, OrganizationId, PurchaseOrder, PurchaseOrderId, Shipment, ShipmentId,
    ShipmentStatus, ThresholdConfigEntry, Timestamp, User, UserRole,
};

/// Unique index name backing "one active conflict per (subject, type)".
pub const CONFLICT_ACTIVE_CONSTRAINT: &str = "conflicts_one_active_per_subject";

/// Unique index name backing "one notification per (entity, level, day)".
pub const NOTIFICATION_DEDUPE_CONSTRAINT: &str = "notifications_dedupe_per_day";

// ============================================================================
// UPDATE TYPES
// ============================================================================

/// Update payload for shipments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShipmentUpdate {
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
    pub status: Option<ShipmentStatus>,
    pub supplier_aos: Option<Date>,
    pub logistics_eta: Option<Date>,
    pub actual_delivery_date: Option<Date>,
    pub is_tracking_linked: Option<bool>,
    pub is_exception: Option<bool>,
}

impl ShipmentUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Update payload for conflicts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictUpdate {
    pub severity: Option<ConflictSeverity>,
    pub state: Option<ConflictState>,
    pub description: Option<String>,
    pub resolved_at: Option<Timestamp>,
}

impl ConflictUpdate {
    /// Transition to RESOLVED at `at`.
    pub fn resolve(at: Timestamp) -> Self {
        Self {
            state: Some(ConflictState::Resolved),
            resolved_at: Some(at),
            ..Self::default()
        }
    }
}

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Async storage trait for Keystone entities.
///
/// Lookups return `Ok(None)` for a missing row; updates of a missing row fail
/// with `StorageError::NotFound`. Implementations must enforce the two
/// uniqueness backstops ([`CONFLICT_ACTIVE_CONSTRAINT`] and
/// [`NOTIFICATION_DEDUPE_CONSTRAINT`]) by failing the insert with
/// `StorageError::UniqueViolation`.
#[async_trait]
pub trait Storage: Send + Sync {
    // ========================================================================
    // THRESHOLD CONFIG
    // ========================================================================

    /// Global rows plus the rows of `organization_id` (if any).
    async fn config_list(
        &self,
        organization_id: Option<OrganizationId>,
    ) -> KeystoneResult<Vec<ThresholdConfigEntry>>;

    /// Insert or replace a row keyed by (organization, key).
    async fn config_upsert(&self, entry: &ThresholdConfigEntry) -> KeystoneResult<()>;

    // ========================================================================
    // TENANCY
    // ========================================================================

    async fn organization_insert(&self, org: &Organization) -> KeystoneResult<()>;

    async fn organization_list(&self) -> KeystoneResult<Vec<Organization>>;

    async fn user_insert(&self, user: &User) -> KeystoneResult<()>;

    /// Active users of an organization holding `role`.
    async fn user_list_by_role(
        &self,
        organization_id: OrganizationId,
        role: UserRole,
    ) -> KeystoneResult<Vec<User>>;

    async fn purchase_order_insert(&self, po: &PurchaseOrder) -> KeystoneResult<()>;

    async fn purchase_order_get(&self, id: PurchaseOrderId) -> KeystoneResult<Option<PurchaseOrder>>;

    async fn purchase_order_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<PurchaseOrder>>;

    // ========================================================================
    // SHIPMENTS AND RECEIPTS
    // ========================================================================

    async fn shipment_insert(&self, shipment: &Shipment) -> KeystoneResult<()>;

    async fn shipment_get(&self, id: ShipmentId) -> KeystoneResult<Option<Shipment>>;

    async fn shipment_update(&self, id: ShipmentId, update: ShipmentUpdate) -> KeystoneResult<()>;

    async fn shipment_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Shipment>>;

    async fn delivery_receipt_insert(&self, receipt: &DeliveryReceipt) -> KeystoneResult<()>;

    async fn delivery_receipt_get(
        &self,
        id: DeliveryReceiptId,
    ) -> KeystoneResult<Option<DeliveryReceipt>>;

    // ========================================================================
    // CONFLICTS
    // ========================================================================

    async fn conflict_insert(&self, conflict: &ConflictRecord) -> KeystoneResult<()>;

    async fn conflict_get(&self, id: ConflictId) -> KeystoneResult<Option<ConflictRecord>>;

    /// The active (non-resolved) conflict of `conflict_type` against `subject`.
    async fn conflict_find_active(
        &self,
        subject: EntityRef,
        conflict_type: ConflictType,
    ) -> KeystoneResult<Option<ConflictRecord>>;

    async fn conflict_update(&self, id: ConflictId, update: ConflictUpdate) -> KeystoneResult<()>;

    /// Conflicts matching `filter`, oldest first.
    async fn conflict_list(&self, filter: &ConflictFilter) -> KeystoneResult<Vec<ConflictRecord>>;

    /// Stamp `digest_sent_at` on every listed conflict. Returns rows touched.
    async fn conflict_mark_digest_sent(
        &self,
        ids: &[ConflictId],
        at: Timestamp,
    ) -> KeystoneResult<u64>;

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    async fn notification_insert(&self, notification: &Notification) -> KeystoneResult<()>;

    /// Whether a notification for `entity` at `level` was created at or after `since`.
    async fn notification_exists_since(
        &self,
        entity: EntityRef,
        level: EscalationLevel,
        since: Timestamp,
    ) -> KeystoneResult<bool>;

    /// Notifications of an organization, newest first.
    async fn notification_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Notification>>;

    // ========================================================================
    // ESCALATION SUBJECTS
    // ========================================================================

    async fn invoice_insert(&self, invoice: &Invoice) -> KeystoneResult<()>;

    async fn invoice_get(&self, id: InvoiceId) -> KeystoneResult<Option<Invoice>>;

    /// Invoices in one of `statuses` whose due date is before `due_before`.
    async fn invoice_list_overdue(
        &self,
        statuses: &[InvoiceStatus],
        due_before: Date,
    ) -> KeystoneResult<Vec<Invoice>>;

    async fn invoice_update_status(&self, id: InvoiceId, status: InvoiceStatus) -> KeystoneResult<()>;

    async fn invoice_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Invoice>>;

    async fn change_order_insert(&self, change_order: &ChangeOrder) -> KeystoneResult<()>;

    /// Submitted or under-review change orders that carry a submission timestamp.
    async fn change_order_list_pending(&self) -> KeystoneResult<Vec<ChangeOrder>>;

    async fn milestone_insert(&self, milestone: &Milestone) -> KeystoneResult<()>;

    /// Milestones at 100% progress that have not been validated.
    async fn milestone_list_awaiting_validation(&self) -> KeystoneResult<Vec<Milestone>>;

    // ========================================================================
    // AUDIT
    // ========================================================================

    async fn audit_log_insert(&self, entry: &AuditLogEntry) -> KeystoneResult<()>;

    async fn audit_log_list_by_entity(&self, entity: EntityRef) -> KeystoneResult<Vec<AuditLogEntry>>;
}
