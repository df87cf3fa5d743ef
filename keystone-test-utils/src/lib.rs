//! Keystone Test Utilities
//!
//! Centralized test infrastructure for the Keystone workspace:
//! - Proptest generators for entity types and threshold inputs
//! - A seeded tenant fixture over any `Storage`
//! - A recording digest mailer with injectable failures
//! - Custom assertions for Keystone-specific errors

// Re-export mock storage from its source crate
pub use keystone_storage::{MockStorage, Storage};

// Re-export core types for convenience
pub use keystone_core::{
    ChangeOrder, ChangeOrderId, ChangeOrderStatus, ConflictRecord, ConflictSeverity,
    ConflictState, ConflictType, Date, DeliveryLineItem, DigestMailer, EntityIdType, EntityType,
    EscalationLevel, Invoice, InvoiceId, InvoiceStatus, KeystoneError, KeystoneResult, Milestone,
    MilestoneId, NotificationError, Organization, OrganizationId, ProjectId, PurchaseOrder,
    PurchaseOrderId, Shipment, ShipmentId, ShipmentStatus, StorageError, Timestamp, User,
    UserDigest, UserId, UserRole, BoqItemId,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Parse an RFC 3339 timestamp; panics on malformed input (tests only).
#[track_caller]
pub fn ts(s: &str) -> Timestamp {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| panic!("bad timestamp {s}: {e}"))
}

/// Build a calendar date; panics on an impossible date (tests only).
#[track_caller]
pub fn date(y: i32, m: u32, d: u32) -> Date {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_else(|| panic!("bad date {y}-{m}-{d}"))
}

// ============================================================================
// RECORDING MAILER
// ============================================================================

/// Digest mailer that records deliveries instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<UserDigest>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `email` fail.
    pub fn fail_for(&self, email: impl Into<String>) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(email.into());
        }
    }

    pub fn sent(&self) -> Vec<UserDigest> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DigestMailer for RecordingMailer {
    async fn send_digest(&self, digest: &UserDigest) -> Result<(), NotificationError> {
        let should_fail = self
            .failing
            .lock()
            .map(|f| f.contains(&digest.email))
            .unwrap_or(false);
        if should_fail {
            return Err(NotificationError::SendFailed {
                recipient: digest.email.clone(),
                reason: "injected failure".to_string(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(digest.clone());
        }
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Keystone inputs.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random UUID (for generic ID generation).
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_shipment_id() -> impl Strategy<Value = ShipmentId> {
        arb_uuid().prop_map(ShipmentId::new)
    }

    /// Generate a date between 2020 and 2030.
    pub fn arb_date() -> impl Strategy<Value = Date> {
        (0i64..3650).prop_map(|offset| date(2020, 1, 1) + chrono::Duration::days(offset))
    }

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Ordered (tolerance, high) day pair.
    pub fn arb_delay_thresholds() -> impl Strategy<Value = (i64, i64)> {
        (0i64..15, 0i64..30).prop_map(|(tolerance, extra)| (tolerance, tolerance + extra))
    }

    /// Ordered (variance, high variance) percent pair.
    pub fn arb_variance_thresholds() -> impl Strategy<Value = (f64, f64)> {
        (0.0f64..25.0, 0.0f64..50.0).prop_map(|(low, extra)| (low, low + extra))
    }

    pub fn arb_line_item() -> impl Strategy<Value = DeliveryLineItem> {
        (0.0f64..10_000.0, 0.0f64..10_000.0).prop_map(|(declared, delivered)| DeliveryLineItem {
            boq_item_id: BoqItemId::now_v7(),
            description: "generated line".to_string(),
            declared_quantity: declared,
            delivered_quantity: delivered,
        })
    }

    pub fn arb_conflict_severity() -> impl Strategy<Value = ConflictSeverity> {
        prop_oneof![
            Just(ConflictSeverity::Low),
            Just(ConflictSeverity::Medium),
            Just(ConflictSeverity::High),
        ]
    }

    pub fn arb_conflict_state() -> impl Strategy<Value = ConflictState> {
        prop_oneof![
            Just(ConflictState::Open),
            Just(ConflictState::Review),
            Just(ConflictState::Resolved),
            Just(ConflictState::Escalated),
        ]
    }

    pub fn arb_invoice_status() -> impl Strategy<Value = InvoiceStatus> {
        proptest::sample::select(InvoiceStatus::ALL.to_vec())
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// One seeded tenant: organization, project, purchase order and users.
    #[derive(Debug, Clone)]
    pub struct Fixture {
        pub organization: Organization,
        pub project_id: ProjectId,
        pub purchase_order: PurchaseOrder,
        pub pms: Vec<User>,
        pub executive: User,
        pub finance: User,
    }

    impl Fixture {
        /// Seed a tenant with two active PMs, one inactive PM, an executive
        /// and a finance user.
        pub async fn seed<S: Storage + ?Sized>(store: &S) -> KeystoneResult<Self> {
            Self::seed_named(store, "Acme Build").await
        }

        pub async fn seed_named<S: Storage + ?Sized>(store: &S, name: &str) -> KeystoneResult<Self> {
            let now = ts("2024-01-01T00:00:00Z");
            let organization = Organization {
                organization_id: OrganizationId::now_v7(),
                name: name.to_string(),
                created_at: now,
            };
            store.organization_insert(&organization).await?;

            let project_id = ProjectId::now_v7();
            let purchase_order = PurchaseOrder {
                purchase_order_id: PurchaseOrderId::now_v7(),
                organization_id: organization.organization_id,
                project_id,
                po_number: "PO-1001".to_string(),
                supplier_name: Some("Steel Co".to_string()),
                created_at: now,
            };
            store.purchase_order_insert(&purchase_order).await?;

            let slug = name.to_lowercase().replace(' ', "-");
            let user = |local: &str, role: UserRole, is_active: bool| User {
                user_id: UserId::now_v7(),
                organization_id: organization.organization_id,
                email: format!("{local}@{slug}.test"),
                name: local.to_string(),
                role,
                is_active,
            };
            let pms = vec![user("pm-a", UserRole::Pm, true), user("pm-b", UserRole::Pm, true)];
            let inactive_pm = user("pm-gone", UserRole::Pm, false);
            let executive = user("exec", UserRole::Executive, true);
            let finance = user("finance", UserRole::Finance, true);
            for u in pms.iter().chain([&inactive_pm, &executive, &finance]) {
                store.user_insert(u).await?;
            }

            Ok(Self {
                organization,
                project_id,
                purchase_order,
                pms,
                executive,
                finance,
            })
        }

        pub fn organization_id(&self) -> OrganizationId {
            self.organization.organization_id
        }

        pub fn purchase_order_id(&self) -> PurchaseOrderId {
            self.purchase_order.purchase_order_id
        }

        /// Insert an in-transit shipment on the fixture's purchase order.
        pub async fn shipment<S: Storage + ?Sized>(
            &self,
            store: &S,
            ros_date: Option<Date>,
            supplier_aos: Option<Date>,
            logistics_eta: Option<Date>,
        ) -> KeystoneResult<Shipment> {
            let now = ts("2024-01-01T00:00:00Z");
            let shipment = Shipment {
                shipment_id: ShipmentId::now_v7(),
                purchase_order_id: self.purchase_order_id(),
                carrier: Some("MAERSK".to_string()),
                tracking_number: Some("MSKU1234567".to_string()),
                ros_date,
                supplier_aos,
                logistics_eta,
                actual_delivery_date: None,
                is_tracking_linked: true,
                status: ShipmentStatus::InTransit,
                is_exception: false,
                created_at: now,
                updated_at: now,
            };
            store.shipment_insert(&shipment).await?;
            Ok(shipment)
        }

        pub async fn invoice<S: Storage + ?Sized>(
            &self,
            store: &S,
            due_date: Date,
            status: InvoiceStatus,
        ) -> KeystoneResult<Invoice> {
            let invoice = Invoice {
                invoice_id: InvoiceId::now_v7(),
                purchase_order_id: self.purchase_order_id(),
                invoice_number: format!("INV-{}", due_date.format("%Y%m%d")),
                amount: 12_500.0,
                currency: "USD".to_string(),
                status,
                due_date,
                submitted_at: ts("2023-12-01T00:00:00Z"),
                paid_at: None,
            };
            store.invoice_insert(&invoice).await?;
            Ok(invoice)
        }

        pub async fn change_order<S: Storage + ?Sized>(
            &self,
            store: &S,
            submitted_at: Option<Timestamp>,
            status: ChangeOrderStatus,
        ) -> KeystoneResult<ChangeOrder> {
            let change_order = ChangeOrder {
                change_order_id: ChangeOrderId::now_v7(),
                purchase_order_id: self.purchase_order_id(),
                co_number: "CO-7".to_string(),
                amount_delta: 4_000.0,
                status,
                submitted_at,
            };
            store.change_order_insert(&change_order).await?;
            Ok(change_order)
        }

        pub async fn milestone<S: Storage + ?Sized>(
            &self,
            store: &S,
            progress_percent: f64,
            completed_at: Option<Timestamp>,
        ) -> KeystoneResult<Milestone> {
            let milestone = Milestone {
                milestone_id: MilestoneId::now_v7(),
                purchase_order_id: self.purchase_order_id(),
                title: "Steel erection".to_string(),
                progress_percent,
                completed_at,
                validated_at: None,
                expected_date: None,
            };
            store.milestone_insert(&milestone).await?;
            Ok(milestone)
        }
    }

    pub fn line_item(declared: f64, delivered: f64) -> DeliveryLineItem {
        DeliveryLineItem {
            boq_item_id: BoqItemId::now_v7(),
            description: "Rebar 12mm".to_string(),
            declared_quantity: declared,
            delivered_quantity: delivered,
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Keystone-specific validation.

    use super::*;

    /// Assert that a KeystoneResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(
        result: &KeystoneResult<T>,
        entity_type: EntityType,
    ) {
        match result {
            Err(KeystoneError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Assert that a KeystoneResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &KeystoneResult<T>) {
        match result {
            Err(KeystoneError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::Fixture;
    use super::*;

    #[tokio::test]
    async fn test_fixture_seeds_active_pms_only() {
        let store = MockStorage::new();
        let fixture = Fixture::seed(&store).await.unwrap();
        let pms = store
            .user_list_by_role(fixture.organization_id(), UserRole::Pm)
            .await
            .unwrap();
        assert_eq!(pms.len(), 2);
        assert!(pms.iter().all(|u| u.is_active));
    }

    #[tokio::test]
    async fn test_recording_mailer_failure_injection() {
        let mailer = RecordingMailer::new();
        let digest = UserDigest {
            user_id: UserId::now_v7(),
            email: "pm@acme.test".to_string(),
            name: "pm".to_string(),
            organization_id: OrganizationId::now_v7(),
            conflicts: vec![],
        };
        mailer.send_digest(&digest).await.unwrap();
        mailer.fail_for("pm@acme.test");
        assert!(mailer.send_digest(&digest).await.is_err());
        assert_eq!(mailer.sent_count(), 1);
    }
}
