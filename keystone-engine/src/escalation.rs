//! Escalation Processor
//!
//! Time-based scans over overdue invoices, pending change orders and
//! unvalidated milestones. Each scan maps elapsed days to an escalation level,
//! notifies the level's role at most once per 24 hours and records an audit
//! entry. Scans never fail: per-entity errors are collected in the result.

use crate::constants::{CHANGE_ORDERS_LINK, INVOICES_LINK, MILESTONES_LINK};
use crate::thresholds::load_thresholds;
use keystone_core::{
    days_between, dedupe_window_start, elapsed_days, AuditLogEntry, AuditLogId, ChangeOrder,
    EntityIdType, EntityRef, EntityType, EscalationLadder, EscalationLevel, Invoice,
    InvoiceStatus, KeystoneResult, Milestone, Notification, NotificationId, NotificationMetadata,
    NotificationType, OrganizationId, PurchaseOrder, PurchaseOrderId, StorageError,
    ThresholdConfig, Timestamp,
};
use keystone_storage::Storage;
use serde::Serialize;
use std::collections::HashMap;

// ============================================================================
// RESULTS
// ============================================================================

/// What happened to one entity during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    /// Below the first step of the ladder
    NotDue { days_elapsed: i64 },
    /// Already notified at this level within the last 24 hours
    AlreadyNotified { level: EscalationLevel },
    Notified {
        level: EscalationLevel,
        days_elapsed: i64,
        notification_id: NotificationId,
    },
}

/// Failure attached to one entity (or to the listing query when `entity` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanError {
    pub entity: Option<EntityRef>,
    pub message: String,
}

/// Counters for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Entities examined
    pub processed: u64,
    /// Notifications sent at REMINDER level
    pub reminders: u64,
    /// Notifications sent above REMINDER level
    pub escalations: u64,
    pub errors: Vec<ScanError>,
}

impl ScanResult {
    fn record(&mut self, entity: EntityRef, result: KeystoneResult<EscalationOutcome>) {
        self.processed += 1;
        match result {
            Ok(EscalationOutcome::Notified { level, .. }) if level.is_escalation() => {
                self.escalations += 1
            }
            Ok(EscalationOutcome::Notified { .. }) => self.reminders += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(entity = %entity, error = %e, "Escalation failed for entity");
                self.errors.push(ScanError {
                    entity: Some(entity),
                    message: e.to_string(),
                });
            }
        }
    }

    fn listing_failed(error: impl std::fmt::Display) -> Self {
        Self {
            errors: vec![ScanError {
                entity: None,
                message: error.to_string(),
            }],
            ..Self::default()
        }
    }

    pub fn notified(&self) -> u64 {
        self.reminders + self.escalations
    }
}

/// Aggregate of the three scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EscalationSummary {
    pub invoices: ScanResult,
    pub change_orders: ScanResult,
    pub milestones: ScanResult,
}

impl EscalationSummary {
    fn scans(&self) -> [&ScanResult; 3] {
        [&self.invoices, &self.change_orders, &self.milestones]
    }

    pub fn total_processed(&self) -> u64 {
        self.scans().iter().map(|s| s.processed).sum()
    }

    pub fn total_reminders(&self) -> u64 {
        self.scans().iter().map(|s| s.reminders).sum()
    }

    pub fn total_escalations(&self) -> u64 {
        self.scans().iter().map(|s| s.escalations).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.scans().iter().map(|s| s.errors.len()).sum()
    }
}

// ============================================================================
// SUBJECTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubjectKind {
    Invoice,
    ChangeOrder,
    Milestone,
}

impl SubjectKind {
    fn ladder(&self, config: &ThresholdConfig) -> EscalationLadder {
        match self {
            SubjectKind::Invoice => config.invoice_ladder(),
            SubjectKind::ChangeOrder => config.change_order_ladder(),
            SubjectKind::Milestone => config.milestone_ladder(),
        }
    }

    fn notification_type(&self) -> NotificationType {
        match self {
            SubjectKind::Invoice => NotificationType::InvoiceOverdue,
            SubjectKind::ChangeOrder => NotificationType::ChangeOrderPending,
            SubjectKind::Milestone => NotificationType::MilestoneValidation,
        }
    }

    fn link(&self) -> &'static str {
        match self {
            SubjectKind::Invoice => INVOICES_LINK,
            SubjectKind::ChangeOrder => CHANGE_ORDERS_LINK,
            SubjectKind::Milestone => MILESTONES_LINK,
        }
    }
}

/// One entity due for an escalation check.
#[derive(Debug, Clone)]
struct Due {
    kind: SubjectKind,
    entity: EntityRef,
    purchase_order_id: PurchaseOrderId,
    label: String,
    days_elapsed: i64,
    invoice_status: Option<InvoiceStatus>,
}

impl Due {
    fn invoice(invoice: &Invoice, now: Timestamp) -> Self {
        Self {
            kind: SubjectKind::Invoice,
            entity: invoice.invoice_id.entity_ref(),
            purchase_order_id: invoice.purchase_order_id,
            label: format!("Invoice {}", invoice.invoice_number),
            days_elapsed: days_between(invoice.due_date, now.date_naive()).max(0),
            invoice_status: Some(invoice.status),
        }
    }

    fn change_order(change_order: &ChangeOrder, submitted_at: Timestamp, now: Timestamp) -> Self {
        Self {
            kind: SubjectKind::ChangeOrder,
            entity: change_order.change_order_id.entity_ref(),
            purchase_order_id: change_order.purchase_order_id,
            label: format!("Change order {}", change_order.co_number),
            days_elapsed: elapsed_days(submitted_at, now),
            invoice_status: None,
        }
    }

    fn milestone(milestone: &Milestone, completed_at: Timestamp, now: Timestamp) -> Self {
        Self {
            kind: SubjectKind::Milestone,
            entity: milestone.milestone_id.entity_ref(),
            purchase_order_id: milestone.purchase_order_id,
            label: format!("Milestone \"{}\"", milestone.title),
            days_elapsed: elapsed_days(completed_at, now),
            invoice_status: None,
        }
    }

    fn title(&self, level: EscalationLevel) -> String {
        let what = match self.kind {
            SubjectKind::Invoice => "is overdue",
            SubjectKind::ChangeOrder => "awaits a decision",
            SubjectKind::Milestone => "awaits validation",
        };
        match level {
            EscalationLevel::Reminder => format!("Reminder: {} {}", self.label, what),
            _ => format!("Escalated to {}: {} {}", level, self.label, what),
        }
    }

    fn message(&self, po: &PurchaseOrder) -> String {
        let what = match self.kind {
            SubjectKind::Invoice => "past its due date",
            SubjectKind::ChangeOrder => "since submission without a decision",
            SubjectKind::Milestone => "since completion without validation",
        };
        format!(
            "{} on PO {} has been {} day(s) {}",
            self.label, po.po_number, self.days_elapsed, what
        )
    }
}

// ============================================================================
// SCAN CONTEXT
// ============================================================================

/// Per-scan cache of purchase orders and organization thresholds.
struct ScanContext<'a, S: ?Sized> {
    store: &'a S,
    now: Timestamp,
    purchase_orders: HashMap<PurchaseOrderId, PurchaseOrder>,
    thresholds: HashMap<OrganizationId, ThresholdConfig>,
}

impl<'a, S: Storage + ?Sized> ScanContext<'a, S> {
    fn new(store: &'a S, now: Timestamp) -> Self {
        Self {
            store,
            now,
            purchase_orders: HashMap::new(),
            thresholds: HashMap::new(),
        }
    }

    async fn purchase_order(&mut self, id: PurchaseOrderId) -> KeystoneResult<PurchaseOrder> {
        if let Some(po) = self.purchase_orders.get(&id) {
            return Ok(po.clone());
        }
        let po = self
            .store
            .purchase_order_get(id)
            .await?
            .ok_or(StorageError::NotFound {
                entity_type: EntityType::PurchaseOrder,
                id: id.as_uuid(),
            })?;
        self.purchase_orders.insert(id, po.clone());
        Ok(po)
    }

    async fn thresholds(&mut self, organization_id: OrganizationId) -> ThresholdConfig {
        if let Some(config) = self.thresholds.get(&organization_id) {
            return config.clone();
        }
        let config = load_thresholds(self.store, Some(organization_id)).await;
        self.thresholds.insert(organization_id, config.clone());
        config
    }

    /// Level mapping, dedupe gate, notification, status flip and audit for one entity.
    async fn escalate(&mut self, due: &Due) -> KeystoneResult<EscalationOutcome> {
        let po = self.purchase_order(due.purchase_order_id).await?;
        let config = self.thresholds(po.organization_id).await;
        let level = due.kind.ladder(&config).level_for(due.days_elapsed);
        if level == EscalationLevel::None {
            return Ok(EscalationOutcome::NotDue {
                days_elapsed: due.days_elapsed,
            });
        }

        let since = dedupe_window_start(self.now);
        if self
            .store
            .notification_exists_since(due.entity, level, since)
            .await?
        {
            return Ok(EscalationOutcome::AlreadyNotified { level });
        }

        // The notification is the dedupe marker, so it is written last: a
        // failed flip or audit leaves nothing that blocks the next scan.
        let notification_id = NotificationId::now_v7();

        if let Some(status) = due.invoice_status {
            if status != InvoiceStatus::Overdue {
                self.store
                    .invoice_update_status(due.entity.id.into(), InvoiceStatus::Overdue)
                    .await?;
            }
        }

        self.store
            .audit_log_insert(&AuditLogEntry {
                audit_id: AuditLogId::now_v7(),
                organization_id: po.organization_id,
                entity: due.entity,
                action: format!("ESCALATION_{}", level.as_db_str()),
                details: serde_json::json!({
                    "level": level.as_db_str(),
                    "days_elapsed": due.days_elapsed,
                    "notification_id": notification_id,
                }),
                created_at: self.now,
            })
            .await?;

        let notification = Notification {
            notification_id,
            organization_id: po.organization_id,
            user_id: None,
            target_role: level.target_role(),
            notification_type: due.kind.notification_type(),
            title: due.title(level),
            message: due.message(&po),
            link: Some(format!("{}/{}", due.kind.link(), due.entity.id)),
            metadata: NotificationMetadata {
                entity: due.entity,
                escalation_level: level,
                days_elapsed: Some(due.days_elapsed),
                conflict_ids: Vec::new(),
            },
            created_at: self.now,
            read_at: None,
        };
        match self.store.notification_insert(&notification).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                tracing::debug!(entity = %due.entity, level = %level, "Notification already recorded today");
                return Ok(EscalationOutcome::AlreadyNotified { level });
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            entity = %due.entity,
            level = %level,
            days_elapsed = due.days_elapsed,
            "Escalation notification sent"
        );
        Ok(EscalationOutcome::Notified {
            level,
            days_elapsed: due.days_elapsed,
            notification_id,
        })
    }

    async fn run(mut self, scan: &'static str, due: Vec<Due>) -> ScanResult {
        let mut result = ScanResult::default();
        for item in &due {
            let outcome = self.escalate(item).await;
            result.record(item.entity, outcome);
        }
        tracing::info!(
            scan,
            processed = result.processed,
            reminders = result.reminders,
            escalations = result.escalations,
            errors = result.errors.len(),
            "Escalation scan completed"
        );
        result
    }
}

// ============================================================================
// SCANS
// ============================================================================

/// Escalate invoices past their due date that are still unpaid.
pub async fn process_invoice_escalations<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> ScanResult {
    let invoices = match store
        .invoice_list_overdue(&InvoiceStatus::ESCALATION_ELIGIBLE, now.date_naive())
        .await
    {
        Ok(invoices) => invoices,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list overdue invoices");
            return ScanResult::listing_failed(e);
        }
    };
    let due = invoices.iter().map(|i| Due::invoice(i, now)).collect();
    ScanContext::new(store, now).run("invoices", due).await
}

/// Escalate change orders that have waited too long for a decision.
pub async fn process_change_order_escalations<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> ScanResult {
    let change_orders = match store.change_order_list_pending().await {
        Ok(change_orders) => change_orders,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list pending change orders");
            return ScanResult::listing_failed(e);
        }
    };
    let due = change_orders
        .iter()
        .filter_map(|co| co.submitted_at.map(|at| Due::change_order(co, at, now)))
        .collect();
    ScanContext::new(store, now).run("change_orders", due).await
}

/// Escalate completed milestones still awaiting PM validation.
pub async fn process_milestone_escalations<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> ScanResult {
    let milestones = match store.milestone_list_awaiting_validation().await {
        Ok(milestones) => milestones,
        Err(e) => {
            tracing::error!(error = %e, "Failed to list milestones awaiting validation");
            return ScanResult::listing_failed(e);
        }
    };
    let due = milestones
        .iter()
        .filter(|m| m.awaits_validation())
        .filter_map(|m| m.completed_at.map(|at| Due::milestone(m, at, now)))
        .collect();
    ScanContext::new(store, now).run("milestones", due).await
}

/// Run the three scans concurrently.
pub async fn run_all_escalations<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> EscalationSummary {
    let (invoices, change_orders, milestones) = tokio::join!(
        process_invoice_escalations(store, now),
        process_change_order_escalations(store, now),
        process_milestone_escalations(store, now),
    );
    EscalationSummary {
        invoices,
        change_orders,
        milestones,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{ChangeOrderStatus, UserRole};
    use keystone_storage::MockStorage;
    use keystone_test_utils::fixtures::Fixture;
    use keystone_test_utils::{date, ts};

    fn now() -> Timestamp {
        ts("2024-01-20T09:00:00Z")
    }

    #[tokio::test]
    async fn test_invoice_past_pm_step_notifies_pm_and_flips_status() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let invoice = fx
            .invoice(&store, date(2024, 1, 12), InvoiceStatus::Pending)
            .await
            .unwrap();

        let result = process_invoice_escalations(&store, now()).await;
        assert_eq!(result.processed, 1);
        assert_eq!(result.escalations, 1);
        assert_eq!(result.reminders, 0);
        assert!(result.errors.is_empty());

        let notifications = store
            .notification_list_by_organization(fx.organization_id())
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        let n = &notifications[0];
        assert_eq!(n.target_role, Some(UserRole::Pm));
        assert_eq!(n.notification_type, NotificationType::InvoiceOverdue);
        assert_eq!(n.metadata.escalation_level, EscalationLevel::Pm);
        assert_eq!(n.metadata.days_elapsed, Some(8));
        assert!(n.message.contains("PO-1001"));

        let stored = store.invoice_get(invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Overdue);

        let audit = store
            .audit_log_list_by_entity(invoice.invoice_id.entity_ref())
            .await
            .unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, "ESCALATION_PM");
        assert_eq!(audit[0].details["days_elapsed"], 8);
    }

    #[tokio::test]
    async fn test_invoice_levels_follow_ladder() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        fx.invoice(&store, date(2024, 1, 18), InvoiceStatus::Pending).await.unwrap();
        fx.invoice(&store, date(2024, 1, 2), InvoiceStatus::PartiallyPaid).await.unwrap();
        fx.invoice(&store, date(2024, 1, 20), InvoiceStatus::Pending).await.unwrap();
        fx.invoice(&store, date(2024, 1, 1), InvoiceStatus::Paid).await.unwrap();

        let result = process_invoice_escalations(&store, now()).await;
        // Due today and paid invoices are not listed
        assert_eq!(result.processed, 2);
        assert_eq!(result.reminders, 1);
        assert_eq!(result.escalations, 1);

        let levels: Vec<_> = store
            .notification_list_by_organization(fx.organization_id())
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.metadata.escalation_level, n.target_role))
            .collect();
        assert!(levels.contains(&(EscalationLevel::Reminder, Some(UserRole::Pm))));
        assert!(levels.contains(&(EscalationLevel::Finance, Some(UserRole::Finance))));
    }

    #[tokio::test]
    async fn test_second_scan_within_a_day_is_silent() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        fx.invoice(&store, date(2024, 1, 12), InvoiceStatus::Pending).await.unwrap();

        process_invoice_escalations(&store, now()).await;
        let again = process_invoice_escalations(&store, ts("2024-01-20T20:00:00Z")).await;
        assert_eq!(again.processed, 1);
        assert_eq!(again.notified(), 0);
        assert!(again.errors.is_empty());
        assert_eq!(store.notification_count(), 1);
    }

    #[tokio::test]
    async fn test_change_order_and_milestone_ladders() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        fx.change_order(&store, Some(ts("2024-01-16T08:00:00Z")), ChangeOrderStatus::Submitted)
            .await
            .unwrap();
        fx.change_order(&store, Some(ts("2024-01-10T08:00:00Z")), ChangeOrderStatus::UnderReview)
            .await
            .unwrap();
        fx.change_order(&store, None, ChangeOrderStatus::Submitted).await.unwrap();
        fx.milestone(&store, 100.0, Some(ts("2024-01-14T00:00:00Z"))).await.unwrap();
        fx.milestone(&store, 80.0, None).await.unwrap();

        let change_orders = process_change_order_escalations(&store, now()).await;
        assert_eq!(change_orders.processed, 2);
        assert_eq!(change_orders.reminders, 1);
        assert_eq!(change_orders.escalations, 1);

        let milestones = process_milestone_escalations(&store, now()).await;
        assert_eq!(milestones.processed, 1);
        assert_eq!(milestones.escalations, 1);

        let notifications = store
            .notification_list_by_organization(fx.organization_id())
            .await
            .unwrap();
        assert!(notifications.iter().any(|n| {
            n.notification_type == NotificationType::MilestoneValidation
                && n.target_role == Some(UserRole::Executive)
        }));
    }

    #[tokio::test]
    async fn test_one_failing_row_does_not_abort_scan() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let bad = fx.invoice(&store, date(2024, 1, 12), InvoiceStatus::Pending).await.unwrap();
        fx.invoice(&store, date(2024, 1, 13), InvoiceStatus::Pending).await.unwrap();
        store.fail_writes_for(bad.invoice_id);

        let summary = run_all_escalations(&store, now()).await;
        assert_eq!(summary.invoices.processed, 2);
        assert_eq!(summary.invoices.escalations, 1);
        assert_eq!(summary.invoices.errors.len(), 1);
        assert_eq!(summary.invoices.errors[0].entity, Some(bad.invoice_id.entity_ref()));
        assert_eq!(summary.total_errors(), 1);
    }

    #[tokio::test]
    async fn test_failed_status_flip_is_retried_next_scan() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let invoice = fx.invoice(&store, date(2024, 1, 12), InvoiceStatus::Pending).await.unwrap();
        store.fail_status_updates_for(invoice.invoice_id);

        let first = process_invoice_escalations(&store, now()).await;
        assert_eq!(first.errors.len(), 1);
        assert_eq!(store.notification_count(), 0);
        assert_eq!(store.audit_log_count(), 0);

        store.clear_failures();
        let retry = process_invoice_escalations(&store, ts("2024-01-20T12:00:00Z")).await;
        assert!(retry.errors.is_empty());
        assert_eq!(retry.escalations, 1);
        assert_eq!(store.notification_count(), 1);
        assert_eq!(store.audit_log_count(), 1);
        let stored = store.invoice_get(invoice.invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Overdue);
    }

    #[tokio::test]
    async fn test_org_override_changes_ladder() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        store
            .config_upsert(&keystone_core::ThresholdConfigEntry {
                organization_id: Some(fx.organization_id()),
                key: "invoice_reminder_days".to_string(),
                value: keystone_core::ConfigValue::Number(10.0),
                description: None,
                updated_at: now(),
            })
            .await
            .unwrap();
        fx.invoice(&store, date(2024, 1, 17), InvoiceStatus::Pending).await.unwrap();

        let result = process_invoice_escalations(&store, now()).await;
        assert_eq!(result.processed, 1);
        assert_eq!(result.notified(), 0);
    }
}
