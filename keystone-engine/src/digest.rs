//! Conflict Digest Job
//!
//! Daily batch that bundles open low/medium conflicts per organization and
//! sends one summary to every active PM of that organization.

use crate::constants::CONFLICTS_LINK;
use crate::thresholds::load_thresholds;
use keystone_core::{
    ConflictFilter, ConflictId, DigestConflict, DigestMailer, EntityIdType, EscalationLevel,
    KeystoneResult, Notification, NotificationId, NotificationMetadata, NotificationType,
    OrganizationId, PurchaseOrder, PurchaseOrderId, Timestamp, User, UserDigest, UserRole,
};
use keystone_storage::Storage;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Result of one digest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DigestResult {
    /// False only when the run itself failed (selection or marking).
    pub success: bool,
    pub recipient_count: u64,
    pub conflict_count: u64,
    pub emails_sent: u64,
    /// Per-recipient and job-level failures
    pub errors: Vec<String>,
}

/// What the next digest run would send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestPreview {
    pub enabled: bool,
    pub recipient_count: u64,
    pub conflict_count: u64,
    pub organizations: Vec<OrganizationDigest>,
}

/// Conflicts of one organization and the PMs who receive them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrganizationDigest {
    pub organization_id: OrganizationId,
    pub recipients: Vec<User>,
    pub conflicts: Vec<DigestConflict>,
}

impl OrganizationDigest {
    fn digest_for(&self, user: &User) -> UserDigest {
        UserDigest {
            user_id: user.user_id,
            email: user.email.clone(),
            name: user.name.clone(),
            organization_id: self.organization_id,
            conflicts: self.conflicts.clone(),
        }
    }

    fn conflict_ids(&self) -> Vec<ConflictId> {
        self.conflicts.iter().map(|c| c.conflict_id).collect()
    }
}

async fn digest_enabled<S: Storage + ?Sized>(store: &S) -> bool {
    load_thresholds(store, None).await.digest_enabled()
}

/// Select digest candidates and group them by organization.
///
/// Organizations without an active PM are left out, so their conflicts stay
/// eligible for a later run.
pub async fn select_digest<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> KeystoneResult<Vec<OrganizationDigest>> {
    let conflicts = store
        .conflict_list(&ConflictFilter::digest_candidates(now))
        .await?;

    let mut purchase_orders: HashMap<PurchaseOrderId, Option<PurchaseOrder>> = HashMap::new();
    let mut grouped: BTreeMap<OrganizationId, Vec<DigestConflict>> = BTreeMap::new();
    for conflict in conflicts {
        if !purchase_orders.contains_key(&conflict.purchase_order_id) {
            let po = store.purchase_order_get(conflict.purchase_order_id).await?;
            purchase_orders.insert(conflict.purchase_order_id, po);
        }
        let Some(Some(po)) = purchase_orders.get(&conflict.purchase_order_id) else {
            tracing::warn!(
                conflict_id = %conflict.conflict_id,
                purchase_order_id = %conflict.purchase_order_id,
                "Conflict references a missing purchase order, skipping"
            );
            continue;
        };
        grouped
            .entry(po.organization_id)
            .or_default()
            .push(DigestConflict {
                conflict_id: conflict.conflict_id,
                conflict_type: conflict.conflict_type,
                severity: conflict.severity,
                state: conflict.state,
                description: conflict.description,
                purchase_order_id: conflict.purchase_order_id,
                po_number: po.po_number.clone(),
                created_at: conflict.created_at,
            });
    }

    let mut digests = Vec::with_capacity(grouped.len());
    for (organization_id, conflicts) in grouped {
        let recipients = store.user_list_by_role(organization_id, UserRole::Pm).await?;
        if recipients.is_empty() {
            tracing::warn!(
                organization_id = %organization_id,
                conflicts = conflicts.len(),
                "No active PM to receive the conflict digest"
            );
            continue;
        }
        digests.push(OrganizationDigest {
            organization_id,
            recipients,
            conflicts,
        });
    }
    Ok(digests)
}

/// Send the daily conflict digest.
///
/// Never returns an error; failures are reported in [`DigestResult::errors`].
pub async fn run_conflict_digest<S, M>(store: &S, mailer: &M, now: Timestamp) -> DigestResult
where
    S: Storage + ?Sized,
    M: DigestMailer + ?Sized,
{
    if !digest_enabled(store).await {
        tracing::info!("Conflict digest disabled, skipping");
        return DigestResult {
            success: true,
            ..DigestResult::default()
        };
    }

    let digests = match select_digest(store, now).await {
        Ok(digests) => digests,
        Err(e) => {
            tracing::error!(error = %e, "Conflict digest selection failed");
            return DigestResult {
                success: false,
                errors: vec![format!("selection failed: {}", e)],
                ..DigestResult::default()
            };
        }
    };

    let mut result = DigestResult {
        success: true,
        ..DigestResult::default()
    };
    let mut included: Vec<ConflictId> = Vec::new();

    for org in &digests {
        let conflict_ids = org.conflict_ids();
        result.conflict_count += conflict_ids.len() as u64;

        for user in &org.recipients {
            result.recipient_count += 1;
            let digest = org.digest_for(user);
            if let Err(e) = mailer.send_digest(&digest).await {
                tracing::warn!(user_id = %user.user_id, error = %e, "Digest delivery failed");
                result.errors.push(e.to_string());
                continue;
            }
            result.emails_sent += 1;
            record_digest_notification(store, &digest, &conflict_ids, now, &mut result).await;
        }
        included.extend(conflict_ids);
    }

    if !included.is_empty() {
        if let Err(e) = store.conflict_mark_digest_sent(&included, now).await {
            tracing::error!(error = %e, conflicts = included.len(), "Failed to mark conflicts as digested");
            result.success = false;
            result.errors.push(format!("marking digest sent failed: {}", e));
        }
    }

    tracing::info!(
        recipients = result.recipient_count,
        conflicts = result.conflict_count,
        emails_sent = result.emails_sent,
        errors = result.errors.len(),
        "Conflict digest completed"
    );
    result
}

async fn record_digest_notification<S: Storage + ?Sized>(
    store: &S,
    digest: &UserDigest,
    conflict_ids: &[ConflictId],
    now: Timestamp,
    result: &mut DigestResult,
) {
    let notification = Notification {
        notification_id: NotificationId::now_v7(),
        organization_id: digest.organization_id,
        user_id: Some(digest.user_id),
        target_role: None,
        notification_type: NotificationType::ConflictDigest,
        title: digest.subject(),
        message: digest.render_summary(),
        link: Some(CONFLICTS_LINK.to_string()),
        metadata: NotificationMetadata {
            entity: digest.user_id.entity_ref(),
            escalation_level: EscalationLevel::None,
            days_elapsed: None,
            conflict_ids: conflict_ids.to_vec(),
        },
        created_at: now,
        read_at: None,
    };
    match store.notification_insert(&notification).await {
        Ok(()) => {}
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(user_id = %digest.user_id, "Digest notification already recorded today");
        }
        Err(e) => {
            tracing::warn!(user_id = %digest.user_id, error = %e, "Failed to record digest notification");
            result.errors.push(e.to_string());
        }
    }
}

/// What [`run_conflict_digest`] would send right now, without side effects.
pub async fn preview_next_digest<S: Storage + ?Sized>(
    store: &S,
    now: Timestamp,
) -> KeystoneResult<DigestPreview> {
    if !digest_enabled(store).await {
        return Ok(DigestPreview {
            enabled: false,
            recipient_count: 0,
            conflict_count: 0,
            organizations: Vec::new(),
        });
    }
    let organizations = select_digest(store, now).await?;
    Ok(DigestPreview {
        enabled: true,
        recipient_count: organizations.iter().map(|o| o.recipients.len() as u64).sum(),
        conflict_count: organizations.iter().map(|o| o.conflicts.len() as u64).sum(),
        organizations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_core::{
        ConfigValue, ConflictRecord, ConflictSeverity, ConflictState, ConflictType, ShipmentId,
        ThresholdConfigEntry,
    };
    use keystone_storage::MockStorage;
    use keystone_test_utils::fixtures::Fixture;
    use keystone_test_utils::{ts, RecordingMailer};

    fn now() -> Timestamp {
        ts("2024-02-01T07:00:00Z")
    }

    async fn conflict(
        store: &MockStorage,
        fx: &Fixture,
        severity: ConflictSeverity,
        state: ConflictState,
    ) -> ConflictRecord {
        let at = ts("2024-01-30T10:00:00Z");
        let record = ConflictRecord {
            conflict_id: ConflictId::now_v7(),
            conflict_type: ConflictType::Delay,
            severity,
            state,
            description: "Shipment delayed by 4 days past ROS".to_string(),
            purchase_order_id: fx.purchase_order_id(),
            project_id: fx.project_id,
            shipment_id: Some(ShipmentId::now_v7()),
            delivery_receipt_id: None,
            digest_sent_at: None,
            created_at: at,
            updated_at: at,
            resolved_at: None,
        };
        store.conflict_insert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn test_digest_fans_out_to_active_pms() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let medium = conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Open).await;
        conflict(&store, &fx, ConflictSeverity::Low, ConflictState::Review).await;
        let high = conflict(&store, &fx, ConflictSeverity::High, ConflictState::Open).await;
        conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Resolved).await;

        let mailer = RecordingMailer::new();
        let result = run_conflict_digest(&store, &mailer, now()).await;

        assert!(result.success);
        assert_eq!(result.recipient_count, 2);
        assert_eq!(result.conflict_count, 2);
        assert_eq!(result.emails_sent, 2);
        assert!(result.errors.is_empty());

        let sent = mailer.sent();
        assert!(sent.iter().all(|d| d.conflicts.len() == 2));
        assert!(sent.iter().all(|d| d.email.starts_with("pm-")));

        let stamped = store.conflict_get(medium.conflict_id).await.unwrap().unwrap();
        assert_eq!(stamped.digest_sent_at, Some(now()));
        let untouched = store.conflict_get(high.conflict_id).await.unwrap().unwrap();
        assert_eq!(untouched.digest_sent_at, None);

        let notifications = store
            .notification_list_by_organization(fx.organization_id())
            .await
            .unwrap();
        assert_eq!(notifications.len(), 2);
        assert!(notifications
            .iter()
            .all(|n| n.notification_type == NotificationType::ConflictDigest && n.user_id.is_some()));
    }

    #[tokio::test]
    async fn test_same_day_rerun_sends_nothing() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Open).await;

        let mailer = RecordingMailer::new();
        run_conflict_digest(&store, &mailer, now()).await;
        let again = run_conflict_digest(&store, &mailer, ts("2024-02-01T18:00:00Z")).await;
        assert_eq!(again.conflict_count, 0);
        assert_eq!(again.emails_sent, 0);
        assert_eq!(mailer.sent_count(), 2);

        let next_day = run_conflict_digest(&store, &mailer, ts("2024-02-02T07:00:00Z")).await;
        assert_eq!(next_day.conflict_count, 1);
        assert_eq!(next_day.emails_sent, 2);
    }

    #[tokio::test]
    async fn test_failed_send_is_reported_and_conflicts_still_marked() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let c = conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Open).await;

        let mailer = RecordingMailer::new();
        mailer.fail_for(fx.pms[0].email.clone());
        let result = run_conflict_digest(&store, &mailer, now()).await;

        assert!(result.success);
        assert_eq!(result.recipient_count, 2);
        assert_eq!(result.emails_sent, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains(&fx.pms[0].email));

        let stamped = store.conflict_get(c.conflict_id).await.unwrap().unwrap();
        assert!(stamped.digest_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_disabled_digest_writes_nothing() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Open).await;
        store
            .config_upsert(&ThresholdConfigEntry {
                organization_id: None,
                key: "conflict_digest_enabled".to_string(),
                value: ConfigValue::Bool(false),
                description: None,
                updated_at: now(),
            })
            .await
            .unwrap();
        let writes = store.write_count();

        let mailer = RecordingMailer::new();
        let result = run_conflict_digest(&store, &mailer, now()).await;
        assert_eq!(result.recipient_count, 0);
        assert_eq!(result.conflict_count, 0);
        assert_eq!(result.emails_sent, 0);
        assert_eq!(store.write_count(), writes);
        assert_eq!(mailer.sent_count(), 0);

        let preview = preview_next_digest(&store, now()).await.unwrap();
        assert!(!preview.enabled);
    }

    #[tokio::test]
    async fn test_preview_matches_run_without_writing() {
        let store = MockStorage::new();
        let fx = Fixture::seed(&store).await.unwrap();
        let other = Fixture::seed_named(&store, "Borealis Civil").await.unwrap();
        conflict(&store, &fx, ConflictSeverity::Medium, ConflictState::Open).await;
        conflict(&store, &other, ConflictSeverity::Low, ConflictState::Open).await;
        conflict(&store, &other, ConflictSeverity::Medium, ConflictState::Open).await;
        let writes = store.write_count();

        let preview = preview_next_digest(&store, now()).await.unwrap();
        assert!(preview.enabled);
        assert_eq!(preview.organizations.len(), 2);
        assert_eq!(preview.recipient_count, 4);
        assert_eq!(preview.conflict_count, 3);
        assert_eq!(store.write_count(), writes);

        let result = run_conflict_digest(&store, &RecordingMailer::new(), now()).await;
        assert_eq!(result.recipient_count, preview.recipient_count);
        assert_eq!(result.conflict_count, preview.conflict_count);
    }
}
