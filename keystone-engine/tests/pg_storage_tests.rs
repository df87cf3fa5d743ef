//! PostgreSQL storage smoke tests.
//!
//! Run with `--features db-tests` against a database reachable through the
//! `KEYSTONE_DB_*` environment variables.

#![cfg(feature = "db-tests")]

use keystone_core::*;
use keystone_engine::{check_and_create_delay_conflict, DbConfig, PgStorage};
use keystone_storage::{Storage, CONFLICT_ACTIVE_CONSTRAINT};
use keystone_test_utils::fixtures::Fixture;
use keystone_test_utils::{date, ts};

async fn test_db() -> KeystoneResult<PgStorage> {
    let store = PgStorage::from_config(&DbConfig::from_env())?;
    store.ensure_schema().await?;
    Ok(store)
}

#[tokio::test]
async fn smoke_test_delay_conflict_round_trip() -> KeystoneResult<()> {
    let store = test_db().await?;
    let fx = Fixture::seed(&store).await?;
    let shipment = fx
        .shipment(&store, Some(date(2024, 1, 1)), Some(date(2024, 1, 10)), None)
        .await?;

    let conflict_id = check_and_create_delay_conflict(&store, shipment.shipment_id, ts("2023-12-20T00:00:00Z"))
        .await?
        .expect("conflict created");
    let conflict = store.conflict_get(conflict_id).await?.expect("stored");
    assert_eq!(conflict.severity, ConflictSeverity::High);

    let active = store
        .conflict_find_active(shipment.shipment_id.entity_ref(), ConflictType::Delay)
        .await?;
    assert_eq!(active.map(|c| c.conflict_id), Some(conflict_id));
    Ok(())
}

#[tokio::test]
async fn smoke_test_second_active_conflict_is_rejected() -> KeystoneResult<()> {
    let store = test_db().await?;
    let fx = Fixture::seed(&store).await?;
    let shipment = fx.shipment(&store, Some(date(2024, 1, 1)), None, None).await?;
    let at = ts("2024-01-02T00:00:00Z");
    let record = ConflictRecord {
        conflict_id: ConflictId::now_v7(),
        conflict_type: ConflictType::Delay,
        severity: ConflictSeverity::Medium,
        state: ConflictState::Open,
        description: "Shipment delayed by 3 days past ROS".to_string(),
        purchase_order_id: fx.purchase_order_id(),
        project_id: fx.project_id,
        shipment_id: Some(shipment.shipment_id),
        delivery_receipt_id: None,
        digest_sent_at: None,
        created_at: at,
        updated_at: at,
        resolved_at: None,
    };
    store.conflict_insert(&record).await?;

    let duplicate = ConflictRecord {
        conflict_id: ConflictId::now_v7(),
        ..record
    };
    match store.conflict_insert(&duplicate).await {
        Err(KeystoneError::Storage(StorageError::UniqueViolation { constraint, .. })) => {
            assert_eq!(constraint, CONFLICT_ACTIVE_CONSTRAINT);
        }
        other => panic!("Expected unique violation, got: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn smoke_test_overdue_invoice_listing() -> KeystoneResult<()> {
    let store = test_db().await?;
    let fx = Fixture::seed(&store).await?;
    let overdue = fx.invoice(&store, date(2024, 1, 5), InvoiceStatus::Pending).await?;
    fx.invoice(&store, date(2024, 1, 5), InvoiceStatus::Paid).await?;

    let listed = store
        .invoice_list_overdue(&InvoiceStatus::ESCALATION_ELIGIBLE, date(2024, 1, 6))
        .await?;
    assert!(listed.iter().any(|i| i.invoice_id == overdue.invoice_id));
    assert!(listed.iter().all(|i| i.status != InvoiceStatus::Paid));
    Ok(())
}
