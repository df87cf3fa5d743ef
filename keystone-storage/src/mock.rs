//! In-memory storage for tests and local dry runs.

use crate::{
    ConflictUpdate, ShipmentUpdate, Storage, CONFLICT_ACTIVE_CONSTRAINT,
    NOTIFICATION_DEDUPE_CONSTRAINT,
};
use ::async_trait::async_trait;
use chrono::Utc;
use keystone_core::{
    AuditLogEntry, ChangeOrder, ChangeOrderId, ChangeOrderStatus, ConflictFilter, ConflictId,
    ConflictRecord, ConflictType, Date, DedupeKey, DeliveryReceipt, DeliveryReceiptId, EntityRef,
    EntityType, EscalationLevel, Invoice, InvoiceId, InvoiceStatus, KeystoneError, KeystoneResult,
    Milestone, MilestoneId, Notification, NotificationId, Organization, OrganizationId,
    PurchaseOrder, PurchaseOrderId, Shipment, ShipmentId, StorageError, ThresholdConfigEntry,
    Timestamp, User, UserId, UserRole,
};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

type ConfigKeyed = (Option<OrganizationId>, String);

/// In-memory mock storage for testing.
///
/// Enforces the same uniqueness backstops as the PostgreSQL schema and
/// supports injecting write failures for individual entity IDs.
#[derive(Debug, Default)]
pub struct MockStorage {
    config: Arc<RwLock<HashMap<ConfigKeyed, ThresholdConfigEntry>>>,
    organizations: Arc<RwLock<HashMap<OrganizationId, Organization>>>,
    users: Arc<RwLock<HashMap<UserId, User>>>,
    purchase_orders: Arc<RwLock<HashMap<PurchaseOrderId, PurchaseOrder>>>,
    shipments: Arc<RwLock<HashMap<ShipmentId, Shipment>>>,
    receipts: Arc<RwLock<HashMap<DeliveryReceiptId, DeliveryReceipt>>>,
    conflicts: Arc<RwLock<HashMap<ConflictId, ConflictRecord>>>,
    notifications: Arc<RwLock<HashMap<NotificationId, Notification>>>,
    notification_keys: Arc<RwLock<HashSet<DedupeKey>>>,
    invoices: Arc<RwLock<HashMap<InvoiceId, Invoice>>>,
    change_orders: Arc<RwLock<HashMap<ChangeOrderId, ChangeOrder>>>,
    milestones: Arc<RwLock<HashMap<MilestoneId, Milestone>>>,
    audit_log: Arc<RwLock<Vec<AuditLogEntry>>>,
    failing: Arc<RwLock<HashSet<Uuid>>>,
    failing_status_updates: Arc<RwLock<HashSet<Uuid>>>,
    writes: Arc<AtomicU64>,
}

fn read<T>(lock: &RwLock<T>) -> KeystoneResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| KeystoneError::from(StorageError::LockPoisoned))
}

fn write<T>(lock: &RwLock<T>) -> KeystoneResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| KeystoneError::from(StorageError::LockPoisoned))
}

fn not_found(entity_type: EntityType, id: Uuid) -> KeystoneError {
    StorageError::NotFound { entity_type, id }.into()
}

fn insert_new<K: Eq + Hash, V: Clone>(
    lock: &RwLock<HashMap<K, V>>,
    key: K,
    value: &V,
    entity_type: EntityType,
) -> KeystoneResult<()> {
    let mut map = write(lock)?;
    if map.contains_key(&key) {
        return Err(StorageError::InsertFailed {
            entity_type,
            reason: "already exists".to_string(),
        }
        .into());
    }
    map.insert(key, value.clone());
    Ok(())
}

impl MockStorage {
    /// Create a new mock storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `id` fail with a backend error.
    pub fn fail_writes_for(&self, id: impl Into<Uuid>) {
        if let Ok(mut failing) = self.failing.write() {
            failing.insert(id.into());
        }
    }

    /// Make only invoice status updates for `id` fail; other writes succeed.
    pub fn fail_status_updates_for(&self, id: impl Into<Uuid>) {
        if let Ok(mut failing) = self.failing_status_updates.write() {
            failing.insert(id.into());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing.write() {
            failing.clear();
        }
        if let Ok(mut failing) = self.failing_status_updates.write() {
            failing.clear();
        }
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn audit_log_count(&self) -> usize {
        self.audit_log.read().map(|v| v.len()).unwrap_or(0)
    }

    fn check_failure(&self, id: Uuid) -> KeystoneResult<()> {
        Self::check_in(&self.failing, id)
    }

    fn check_in(set: &RwLock<HashSet<Uuid>>, id: Uuid) -> KeystoneResult<()> {
        if read(set)?.contains(&id) {
            return Err(StorageError::Backend {
                reason: format!("injected write failure for {}", id),
            }
            .into());
        }
        Ok(())
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn has_other_active(
        conflicts: &HashMap<ConflictId, ConflictRecord>,
        candidate: &ConflictRecord,
    ) -> bool {
        let subject = candidate.subject();
        conflicts.values().any(|c| {
            c.conflict_id != candidate.conflict_id
                && c.state.is_active()
                && c.conflict_type == candidate.conflict_type
                && c.subject() == subject
        })
    }
}

#[async_trait]
impl Storage for MockStorage {
    // === Threshold Config ===

    async fn config_list(
        &self,
        organization_id: Option<OrganizationId>,
    ) -> KeystoneResult<Vec<ThresholdConfigEntry>> {
        let config = read(&self.config)?;
        Ok(config
            .values()
            .filter(|e| e.organization_id.is_none() || e.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn config_upsert(&self, entry: &ThresholdConfigEntry) -> KeystoneResult<()> {
        write(&self.config)?.insert((entry.organization_id, entry.key.clone()), entry.clone());
        self.wrote();
        Ok(())
    }

    // === Tenancy ===

    async fn organization_insert(&self, org: &Organization) -> KeystoneResult<()> {
        insert_new(&self.organizations, org.organization_id, org, EntityType::Organization)?;
        self.wrote();
        Ok(())
    }

    async fn organization_list(&self) -> KeystoneResult<Vec<Organization>> {
        let mut orgs: Vec<_> = read(&self.organizations)?.values().cloned().collect();
        orgs.sort_by_key(|o| o.organization_id);
        Ok(orgs)
    }

    async fn user_insert(&self, user: &User) -> KeystoneResult<()> {
        insert_new(&self.users, user.user_id, user, EntityType::User)?;
        self.wrote();
        Ok(())
    }

    async fn user_list_by_role(
        &self,
        organization_id: OrganizationId,
        role: UserRole,
    ) -> KeystoneResult<Vec<User>> {
        let mut users: Vec<_> = read(&self.users)?
            .values()
            .filter(|u| u.organization_id == organization_id && u.role == role && u.is_active)
            .cloned()
            .collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    async fn purchase_order_insert(&self, po: &PurchaseOrder) -> KeystoneResult<()> {
        insert_new(&self.purchase_orders, po.purchase_order_id, po, EntityType::PurchaseOrder)?;
        self.wrote();
        Ok(())
    }

    async fn purchase_order_get(&self, id: PurchaseOrderId) -> KeystoneResult<Option<PurchaseOrder>> {
        Ok(read(&self.purchase_orders)?.get(&id).cloned())
    }

    async fn purchase_order_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<PurchaseOrder>> {
        let mut pos: Vec<_> = read(&self.purchase_orders)?
            .values()
            .filter(|po| po.organization_id == organization_id)
            .cloned()
            .collect();
        pos.sort_by_key(|po| po.created_at);
        Ok(pos)
    }

    // === Shipments and Receipts ===

    async fn shipment_insert(&self, shipment: &Shipment) -> KeystoneResult<()> {
        insert_new(&self.shipments, shipment.shipment_id, shipment, EntityType::Shipment)?;
        self.wrote();
        Ok(())
    }

    async fn shipment_get(&self, id: ShipmentId) -> KeystoneResult<Option<Shipment>> {
        Ok(read(&self.shipments)?.get(&id).cloned())
    }

    async fn shipment_update(&self, id: ShipmentId, update: ShipmentUpdate) -> KeystoneResult<()> {
        self.check_failure(id.as_uuid())?;
        let mut shipments = write(&self.shipments)?;
        let shipment = shipments
            .get_mut(&id)
            .ok_or_else(|| not_found(EntityType::Shipment, id.as_uuid()))?;

        if let Some(carrier) = update.carrier {
            shipment.carrier = Some(carrier);
        }
        if let Some(tracking_number) = update.tracking_number {
            shipment.tracking_number = Some(tracking_number);
        }
        if let Some(status) = update.status {
            shipment.status = status;
        }
        if let Some(aos) = update.supplier_aos {
            shipment.supplier_aos = Some(aos);
        }
        if let Some(eta) = update.logistics_eta {
            shipment.logistics_eta = Some(eta);
        }
        if let Some(delivered) = update.actual_delivery_date {
            shipment.actual_delivery_date = Some(delivered);
        }
        if let Some(linked) = update.is_tracking_linked {
            shipment.is_tracking_linked = linked;
        }
        if let Some(exception) = update.is_exception {
            shipment.is_exception = exception;
        }
        shipment.updated_at = Utc::now();
        drop(shipments);
        self.wrote();
        Ok(())
    }

    async fn shipment_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Shipment>> {
        let po_ids: HashSet<PurchaseOrderId> = read(&self.purchase_orders)?
            .values()
            .filter(|po| po.organization_id == organization_id)
            .map(|po| po.purchase_order_id)
            .collect();
        let mut shipments: Vec<_> = read(&self.shipments)?
            .values()
            .filter(|s| po_ids.contains(&s.purchase_order_id))
            .cloned()
            .collect();
        shipments.sort_by_key(|s| s.created_at);
        Ok(shipments)
    }

    async fn delivery_receipt_insert(&self, receipt: &DeliveryReceipt) -> KeystoneResult<()> {
        self.check_failure(receipt.shipment_id.as_uuid())?;
        insert_new(&self.receipts, receipt.receipt_id, receipt, EntityType::DeliveryReceipt)?;
        self.wrote();
        Ok(())
    }

    async fn delivery_receipt_get(
        &self,
        id: DeliveryReceiptId,
    ) -> KeystoneResult<Option<DeliveryReceipt>> {
        Ok(read(&self.receipts)?.get(&id).cloned())
    }

    // === Conflicts ===

    async fn conflict_insert(&self, conflict: &ConflictRecord) -> KeystoneResult<()> {
        if let Some(subject) = conflict.subject() {
            self.check_failure(subject.id)?;
        }
        self.check_failure(conflict.purchase_order_id.as_uuid())?;
        let mut conflicts = write(&self.conflicts)?;
        if conflicts.contains_key(&conflict.conflict_id) {
            return Err(StorageError::InsertFailed {
                entity_type: EntityType::Conflict,
                reason: "already exists".to_string(),
            }
            .into());
        }
        if conflict.state.is_active() && Self::has_other_active(&conflicts, conflict) {
            return Err(StorageError::UniqueViolation {
                constraint: CONFLICT_ACTIVE_CONSTRAINT.to_string(),
                reason: format!(
                    "active {} conflict already exists for {:?}",
                    conflict.conflict_type,
                    conflict.subject()
                ),
            }
            .into());
        }
        conflicts.insert(conflict.conflict_id, conflict.clone());
        drop(conflicts);
        self.wrote();
        Ok(())
    }

    async fn conflict_get(&self, id: ConflictId) -> KeystoneResult<Option<ConflictRecord>> {
        Ok(read(&self.conflicts)?.get(&id).cloned())
    }

    async fn conflict_find_active(
        &self,
        subject: EntityRef,
        conflict_type: ConflictType,
    ) -> KeystoneResult<Option<ConflictRecord>> {
        let filter = ConflictFilter::active_for(subject, conflict_type);
        Ok(read(&self.conflicts)?
            .values()
            .filter(|c| filter.matches(c))
            .min_by_key(|c| c.created_at)
            .cloned())
    }

    async fn conflict_update(&self, id: ConflictId, update: ConflictUpdate) -> KeystoneResult<()> {
        let mut conflicts = write(&self.conflicts)?;
        let mut updated = conflicts
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(EntityType::Conflict, id.as_uuid()))?;

        if let Some(severity) = update.severity {
            updated.severity = severity;
        }
        if let Some(state) = update.state {
            updated.state = state;
        }
        if let Some(description) = update.description {
            updated.description = description;
        }
        if let Some(resolved_at) = update.resolved_at {
            updated.resolved_at = Some(resolved_at);
        }
        if updated.state.is_active() && Self::has_other_active(&conflicts, &updated) {
            return Err(StorageError::UniqueViolation {
                constraint: CONFLICT_ACTIVE_CONSTRAINT.to_string(),
                reason: format!("reopening {} would duplicate an active conflict", id),
            }
            .into());
        }
        updated.updated_at = Utc::now();
        conflicts.insert(id, updated);
        drop(conflicts);
        self.wrote();
        Ok(())
    }

    async fn conflict_list(&self, filter: &ConflictFilter) -> KeystoneResult<Vec<ConflictRecord>> {
        let mut conflicts: Vec<_> = read(&self.conflicts)?
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| (c.created_at, c.conflict_id));
        Ok(conflicts)
    }

    async fn conflict_mark_digest_sent(
        &self,
        ids: &[ConflictId],
        at: Timestamp,
    ) -> KeystoneResult<u64> {
        let mut conflicts = write(&self.conflicts)?;
        let mut touched = 0;
        for id in ids {
            if let Some(conflict) = conflicts.get_mut(id) {
                conflict.digest_sent_at = Some(at);
                touched += 1;
            }
        }
        drop(conflicts);
        if touched > 0 {
            self.wrote();
        }
        Ok(touched)
    }

    // === Notifications ===

    async fn notification_insert(&self, notification: &Notification) -> KeystoneResult<()> {
        self.check_failure(notification.metadata.entity.id)?;
        let key = notification.dedupe_key();
        let mut keys = write(&self.notification_keys)?;
        if keys.contains(&key) {
            return Err(StorageError::UniqueViolation {
                constraint: NOTIFICATION_DEDUPE_CONSTRAINT.to_string(),
                reason: format!(
                    "{} already notified at level {} on {}",
                    key.entity, key.level, key.day
                ),
            }
            .into());
        }
        insert_new(
            &self.notifications,
            notification.notification_id,
            notification,
            EntityType::Notification,
        )?;
        keys.insert(key);
        drop(keys);
        self.wrote();
        Ok(())
    }

    async fn notification_exists_since(
        &self,
        entity: EntityRef,
        level: EscalationLevel,
        since: Timestamp,
    ) -> KeystoneResult<bool> {
        Ok(read(&self.notifications)?.values().any(|n| {
            n.metadata.entity == entity
                && n.metadata.escalation_level == level
                && n.created_at >= since
        }))
    }

    async fn notification_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Notification>> {
        let mut notifications: Vec<_> = read(&self.notifications)?
            .values()
            .filter(|n| n.organization_id == organization_id)
            .cloned()
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    // === Escalation Subjects ===

    async fn invoice_insert(&self, invoice: &Invoice) -> KeystoneResult<()> {
        insert_new(&self.invoices, invoice.invoice_id, invoice, EntityType::Invoice)?;
        self.wrote();
        Ok(())
    }

    async fn invoice_get(&self, id: InvoiceId) -> KeystoneResult<Option<Invoice>> {
        Ok(read(&self.invoices)?.get(&id).cloned())
    }

    async fn invoice_list_overdue(
        &self,
        statuses: &[InvoiceStatus],
        due_before: Date,
    ) -> KeystoneResult<Vec<Invoice>> {
        let mut invoices: Vec<_> = read(&self.invoices)?
            .values()
            .filter(|i| statuses.contains(&i.status) && i.due_date < due_before)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.due_date, i.invoice_id));
        Ok(invoices)
    }

    async fn invoice_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Invoice>> {
        let po_ids: HashSet<PurchaseOrderId> = read(&self.purchase_orders)?
            .values()
            .filter(|po| po.organization_id == organization_id)
            .map(|po| po.purchase_order_id)
            .collect();
        let mut invoices: Vec<_> = read(&self.invoices)?
            .values()
            .filter(|i| po_ids.contains(&i.purchase_order_id))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| (i.submitted_at, i.invoice_id));
        Ok(invoices)
    }

    async fn invoice_update_status(&self, id: InvoiceId, status: InvoiceStatus) -> KeystoneResult<()> {
        self.check_failure(id.as_uuid())?;
        Self::check_in(&self.failing_status_updates, id.as_uuid())?;
        let mut invoices = write(&self.invoices)?;
        let invoice = invoices
            .get_mut(&id)
            .ok_or_else(|| not_found(EntityType::Invoice, id.as_uuid()))?;
        invoice.status = status;
        drop(invoices);
        self.wrote();
        Ok(())
    }

    async fn change_order_insert(&self, change_order: &ChangeOrder) -> KeystoneResult<()> {
        insert_new(
            &self.change_orders,
            change_order.change_order_id,
            change_order,
            EntityType::ChangeOrder,
        )?;
        self.wrote();
        Ok(())
    }

    async fn change_order_list_pending(&self) -> KeystoneResult<Vec<ChangeOrder>> {
        let mut change_orders: Vec<_> = read(&self.change_orders)?
            .values()
            .filter(|co| ChangeOrderStatus::PENDING.contains(&co.status) && co.submitted_at.is_some())
            .cloned()
            .collect();
        change_orders.sort_by_key(|co| (co.submitted_at, co.change_order_id));
        Ok(change_orders)
    }

    async fn milestone_insert(&self, milestone: &Milestone) -> KeystoneResult<()> {
        insert_new(&self.milestones, milestone.milestone_id, milestone, EntityType::Milestone)?;
        self.wrote();
        Ok(())
    }

    async fn milestone_list_awaiting_validation(&self) -> KeystoneResult<Vec<Milestone>> {
        let mut milestones: Vec<_> = read(&self.milestones)?
            .values()
            .filter(|m| m.awaits_validation())
            .cloned()
            .collect();
        milestones.sort_by_key(|m| (m.completed_at, m.milestone_id));
        Ok(milestones)
    }

    // === Audit ===

    async fn audit_log_insert(&self, entry: &AuditLogEntry) -> KeystoneResult<()> {
        self.check_failure(entry.entity.id)?;
        write(&self.audit_log)?.push(entry.clone());
        self.wrote();
        Ok(())
    }

    async fn audit_log_list_by_entity(&self, entity: EntityRef) -> KeystoneResult<Vec<AuditLogEntry>> {
        Ok(read(&self.audit_log)?
            .iter()
            .filter(|e| e.entity == entity)
            .cloned()
            .collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use keystone_core::{
        ConflictSeverity, ConflictState, EntityIdType, NotificationMetadata, NotificationType,
        ProjectId, ShipmentStatus,
    };

    fn make_test_conflict(shipment_id: ShipmentId) -> ConflictRecord {
        let now = Utc::now();
        ConflictRecord {
            conflict_id: ConflictId::now_v7(),
            conflict_type: ConflictType::Delay,
            severity: ConflictSeverity::Medium,
            state: ConflictState::Open,
            description: "Shipment delayed by 3 days past ROS".to_string(),
            purchase_order_id: PurchaseOrderId::now_v7(),
            project_id: ProjectId::now_v7(),
            shipment_id: Some(shipment_id),
            delivery_receipt_id: None,
            digest_sent_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    fn make_test_notification(entity: EntityRef, level: EscalationLevel) -> Notification {
        Notification {
            notification_id: NotificationId::now_v7(),
            organization_id: OrganizationId::now_v7(),
            user_id: None,
            target_role: level.target_role(),
            notification_type: NotificationType::InvoiceOverdue,
            title: "Invoice overdue".to_string(),
            message: "Invoice INV-1 is 3 days overdue".to_string(),
            link: None,
            metadata: NotificationMetadata {
                entity,
                escalation_level: level,
                days_elapsed: Some(3),
                conflict_ids: vec![],
            },
            created_at: Utc::now(),
            read_at: None,
        }
    }

    fn make_test_shipment() -> Shipment {
        let now = Utc::now();
        Shipment {
            shipment_id: ShipmentId::now_v7(),
            purchase_order_id: PurchaseOrderId::now_v7(),
            carrier: None,
            tracking_number: None,
            ros_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            supplier_aos: None,
            logistics_eta: None,
            actual_delivery_date: None,
            is_tracking_linked: false,
            status: ShipmentStatus::Pending,
            is_exception: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_second_active_conflict_rejected() {
        let storage = MockStorage::new();
        let shipment_id = ShipmentId::now_v7();
        storage.conflict_insert(&make_test_conflict(shipment_id)).await.unwrap();

        let err = storage
            .conflict_insert(&make_test_conflict(shipment_id))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(storage.conflict_count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_conflict_frees_subject() {
        let storage = MockStorage::new();
        let shipment_id = ShipmentId::now_v7();
        let first = make_test_conflict(shipment_id);
        storage.conflict_insert(&first).await.unwrap();
        storage
            .conflict_update(first.conflict_id, ConflictUpdate::resolve(Utc::now()))
            .await
            .unwrap();

        storage.conflict_insert(&make_test_conflict(shipment_id)).await.unwrap();
        let active = storage
            .conflict_find_active(shipment_id.entity_ref(), ConflictType::Delay)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(active.conflict_id, first.conflict_id);

        let reopen = storage
            .conflict_update(
                first.conflict_id,
                ConflictUpdate {
                    state: Some(ConflictState::Open),
                    ..Default::default()
                },
            )
            .await;
        assert!(reopen.unwrap_err().is_unique_violation());
    }

    #[tokio::test]
    async fn test_notification_dedupe_key() {
        let storage = MockStorage::new();
        let entity = InvoiceId::now_v7().entity_ref();
        storage
            .notification_insert(&make_test_notification(entity, EscalationLevel::Reminder))
            .await
            .unwrap();

        let dup = storage
            .notification_insert(&make_test_notification(entity, EscalationLevel::Reminder))
            .await;
        assert!(dup.unwrap_err().is_unique_violation());

        storage
            .notification_insert(&make_test_notification(entity, EscalationLevel::Pm))
            .await
            .unwrap();
        assert_eq!(storage.notification_count(), 2);
    }

    #[tokio::test]
    async fn test_notification_exists_since_window() {
        let storage = MockStorage::new();
        let entity = InvoiceId::now_v7().entity_ref();
        let n = make_test_notification(entity, EscalationLevel::Pm);
        storage.notification_insert(&n).await.unwrap();

        let before = n.created_at - Duration::hours(1);
        let after = n.created_at + Duration::seconds(1);
        assert!(storage.notification_exists_since(entity, EscalationLevel::Pm, before).await.unwrap());
        assert!(!storage.notification_exists_since(entity, EscalationLevel::Pm, after).await.unwrap());
        assert!(!storage
            .notification_exists_since(entity, EscalationLevel::Finance, before)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_shipment_update_applies_fields() {
        let storage = MockStorage::new();
        let shipment = make_test_shipment();
        storage.shipment_insert(&shipment).await.unwrap();

        storage
            .shipment_update(
                shipment.shipment_id,
                ShipmentUpdate {
                    status: Some(ShipmentStatus::InTransit),
                    logistics_eta: NaiveDate::from_ymd_opt(2024, 1, 5),
                    is_exception: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = storage.shipment_get(shipment.shipment_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ShipmentStatus::InTransit);
        assert_eq!(stored.logistics_eta, NaiveDate::from_ymd_opt(2024, 1, 5));
        assert!(stored.is_exception);
        assert_eq!(stored.ros_date, shipment.ros_date);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let storage = MockStorage::new();
        let err = storage
            .shipment_update(ShipmentId::now_v7(), ShipmentUpdate::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_and_write_count() {
        let storage = MockStorage::new();
        let shipment = make_test_shipment();
        storage.shipment_insert(&shipment).await.unwrap();
        assert_eq!(storage.write_count(), 1);

        storage.fail_writes_for(shipment.shipment_id);
        let err = storage
            .shipment_update(shipment.shipment_id, ShipmentUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoneError::Storage(StorageError::Backend { .. })));
        assert_eq!(storage.write_count(), 1);

        storage.clear_failures();
        storage
            .shipment_update(shipment.shipment_id, ShipmentUpdate::default())
            .await
            .unwrap();
        assert_eq!(storage.write_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_digest_sent_counts_existing_rows() {
        let storage = MockStorage::new();
        let conflict = make_test_conflict(ShipmentId::now_v7());
        storage.conflict_insert(&conflict).await.unwrap();
        let now = Utc::now();

        let touched = storage
            .conflict_mark_digest_sent(&[conflict.conflict_id, ConflictId::now_v7()], now)
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let stored = storage.conflict_get(conflict.conflict_id).await.unwrap().unwrap();
        assert_eq!(stored.digest_sent_at, Some(now));
    }

    #[tokio::test]
    async fn test_config_list_scopes_organizations() {
        let storage = MockStorage::new();
        let org = OrganizationId::now_v7();
        let other = OrganizationId::now_v7();
        for owner in [None, Some(org), Some(other)] {
            storage
                .config_upsert(&ThresholdConfigEntry {
                    organization_id: owner,
                    key: "high_delay_days".to_string(),
                    value: keystone_core::ConfigValue::Number(6.0),
                    description: None,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(storage.config_list(Some(org)).await.unwrap().len(), 2);
        assert_eq!(storage.config_list(None).await.unwrap().len(), 1);
    }
}
