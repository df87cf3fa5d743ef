//! PostgreSQL Storage Module
//!
//! Connection pooling with deadpool-postgres and a [`Storage`] implementation
//! over plain tables. Rows are mapped to core structs at this boundary; enums
//! are stored as their database strings.
//!
//! The two uniqueness backstops are unique indexes created by
//! [`PgStorage::ensure_schema`]; a violation surfaces as
//! `StorageError::UniqueViolation`.

use crate::constants::{
    DEFAULT_DB_HOST, DEFAULT_DB_NAME, DEFAULT_DB_POOL_SIZE, DEFAULT_DB_PORT,
    DEFAULT_DB_TIMEOUT_SECS, DEFAULT_DB_USER,
};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use keystone_core::{
    AuditLogEntry, ChangeOrder, ConfigValue, ConflictFilter, ConflictId, ConflictRecord,
    ConflictSeverity, ConflictState, ConflictType, Date, DeliveryReceipt, DeliveryReceiptId,
    EntityRef, EntityType, EnumParseError, EscalationLevel, Invoice, InvoiceId, InvoiceStatus,
    KeystoneError, KeystoneResult, Milestone, Notification, NotificationMetadata, Organization,
    OrganizationId, PurchaseOrder, PurchaseOrderId, Shipment, ShipmentId, StorageError,
    ThresholdConfigEntry, Timestamp, User, UserRole,
};
use keystone_storage::{ConflictUpdate, ShipmentUpdate, Storage};
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::FromSql;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            dbname: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            max_size: DEFAULT_DB_POOL_SIZE,
            timeout: Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from `KEYSTONE_DB_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("KEYSTONE_DB_HOST").unwrap_or_else(|_| DEFAULT_DB_HOST.to_string()),
            port: std::env::var("KEYSTONE_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_PORT),
            dbname: std::env::var("KEYSTONE_DB_NAME").unwrap_or_else(|_| DEFAULT_DB_NAME.to_string()),
            user: std::env::var("KEYSTONE_DB_USER").unwrap_or_else(|_| DEFAULT_DB_USER.to_string()),
            password: std::env::var("KEYSTONE_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("KEYSTONE_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_POOL_SIZE),
            timeout: Duration::from_secs(
                std::env::var("KEYSTONE_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DB_TIMEOUT_SECS),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> KeystoneResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.timeout);

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(self.max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| backend(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Idempotent schema bootstrap.
///
/// Index names must match `keystone_storage::CONFLICT_ACTIVE_CONSTRAINT` and
/// `keystone_storage::NOTIFICATION_DEDUPE_CONSTRAINT`.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    organization_id UUID PRIMARY KEY,
    name            TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    user_id         UUID PRIMARY KEY,
    organization_id UUID NOT NULL REFERENCES organizations(organization_id),
    email           TEXT NOT NULL,
    name            TEXT NOT NULL,
    role            TEXT NOT NULL,
    is_active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS threshold_config (
    organization_id UUID REFERENCES organizations(organization_id),
    key             TEXT NOT NULL,
    value           JSONB NOT NULL,
    description     TEXT,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS threshold_config_org_key
    ON threshold_config (organization_id, key) WHERE organization_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS threshold_config_global_key
    ON threshold_config (key) WHERE organization_id IS NULL;

CREATE TABLE IF NOT EXISTS purchase_orders (
    purchase_order_id UUID PRIMARY KEY,
    organization_id   UUID NOT NULL REFERENCES organizations(organization_id),
    project_id        UUID NOT NULL,
    po_number         TEXT NOT NULL,
    supplier_name     TEXT,
    created_at        TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS shipments (
    shipment_id          UUID PRIMARY KEY,
    purchase_order_id    UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    carrier              TEXT,
    tracking_number      TEXT,
    ros_date             DATE,
    supplier_aos         DATE,
    logistics_eta        DATE,
    actual_delivery_date DATE,
    is_tracking_linked   BOOLEAN NOT NULL DEFAULT FALSE,
    status               TEXT NOT NULL,
    is_exception         BOOLEAN NOT NULL DEFAULT FALSE,
    created_at           TIMESTAMPTZ NOT NULL,
    updated_at           TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_receipts (
    receipt_id        UUID PRIMARY KEY,
    shipment_id       UUID NOT NULL REFERENCES shipments(shipment_id),
    purchase_order_id UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    received_by       UUID,
    received_at       TIMESTAMPTZ NOT NULL,
    line_items        JSONB NOT NULL,
    variance_percent  DOUBLE PRECISION NOT NULL,
    conflict_id       UUID,
    notes             TEXT
);

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id         UUID PRIMARY KEY,
    conflict_type       TEXT NOT NULL,
    severity            TEXT NOT NULL,
    state               TEXT NOT NULL,
    description         TEXT NOT NULL,
    purchase_order_id   UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    project_id          UUID NOT NULL,
    shipment_id         UUID,
    delivery_receipt_id UUID,
    subject_type        TEXT NOT NULL,
    subject_id          UUID NOT NULL,
    digest_sent_at      TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    resolved_at         TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS conflicts_one_active_per_subject
    ON conflicts (subject_type, subject_id, conflict_type) WHERE state <> 'RESOLVED';
CREATE INDEX IF NOT EXISTS conflicts_digest_candidates
    ON conflicts (created_at) WHERE state IN ('OPEN', 'REVIEW');

CREATE TABLE IF NOT EXISTS notifications (
    notification_id   UUID PRIMARY KEY,
    organization_id   UUID NOT NULL REFERENCES organizations(organization_id),
    user_id           UUID,
    target_role       TEXT,
    notification_type TEXT NOT NULL,
    title             TEXT NOT NULL,
    message           TEXT NOT NULL,
    link              TEXT,
    entity_type       TEXT NOT NULL,
    entity_id         UUID NOT NULL,
    escalation_level  SMALLINT NOT NULL,
    metadata          JSONB NOT NULL,
    created_at        TIMESTAMPTZ NOT NULL,
    created_day       DATE NOT NULL,
    read_at           TIMESTAMPTZ
);
CREATE UNIQUE INDEX IF NOT EXISTS notifications_dedupe_per_day
    ON notifications (entity_type, entity_id, escalation_level, created_day);

CREATE TABLE IF NOT EXISTS invoices (
    invoice_id        UUID PRIMARY KEY,
    purchase_order_id UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    invoice_number    TEXT NOT NULL,
    amount            DOUBLE PRECISION NOT NULL,
    currency          TEXT NOT NULL,
    status            TEXT NOT NULL,
    due_date          DATE NOT NULL,
    submitted_at      TIMESTAMPTZ NOT NULL,
    paid_at           TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS change_orders (
    change_order_id   UUID PRIMARY KEY,
    purchase_order_id UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    co_number         TEXT NOT NULL,
    amount_delta      DOUBLE PRECISION NOT NULL,
    status            TEXT NOT NULL,
    submitted_at      TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS milestones (
    milestone_id      UUID PRIMARY KEY,
    purchase_order_id UUID NOT NULL REFERENCES purchase_orders(purchase_order_id),
    title             TEXT NOT NULL,
    progress_percent  DOUBLE PRECISION NOT NULL,
    completed_at      TIMESTAMPTZ,
    validated_at      TIMESTAMPTZ,
    expected_date     DATE
);

CREATE TABLE IF NOT EXISTS audit_log (
    audit_id        UUID PRIMARY KEY,
    organization_id UUID NOT NULL REFERENCES organizations(organization_id),
    entity_type     TEXT NOT NULL,
    entity_id       UUID NOT NULL,
    action          TEXT NOT NULL,
    details         JSONB NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_log_entity ON audit_log (entity_type, entity_id);
"#;

// ============================================================================
// ERROR MAPPING
// ============================================================================

fn backend(reason: impl Into<String>) -> KeystoneError {
    StorageError::Backend {
        reason: reason.into(),
    }
    .into()
}

fn pg_err(err: tokio_postgres::Error) -> KeystoneError {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let constraint = err
            .as_db_error()
            .and_then(|db| db.constraint())
            .unwrap_or_default()
            .to_string();
        return StorageError::UniqueViolation {
            constraint,
            reason: err.to_string(),
        }
        .into();
    }
    tracing::error!(error = ?err, "Database error");
    backend(err.to_string())
}

fn not_found(entity_type: EntityType, id: Uuid) -> KeystoneError {
    StorageError::NotFound { entity_type, id }.into()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn col<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> KeystoneResult<T> {
    row.try_get(name).map_err(pg_err)
}

fn col_enum<T: FromStr<Err = EnumParseError>>(row: &Row, name: &str) -> KeystoneResult<T> {
    let raw: String = col(row, name)?;
    raw.parse()
        .map_err(|e: EnumParseError| backend(format!("column {}: {}", name, e)))
}

fn col_enum_opt<T: FromStr<Err = EnumParseError>>(row: &Row, name: &str) -> KeystoneResult<Option<T>> {
    let raw: Option<String> = col(row, name)?;
    raw.map(|s| s.parse())
        .transpose()
        .map_err(|e: EnumParseError| backend(format!("column {}: {}", name, e)))
}

fn col_json<T: serde::de::DeserializeOwned>(row: &Row, name: &str) -> KeystoneResult<T> {
    let value: serde_json::Value = col(row, name)?;
    serde_json::from_value(value).map_err(|e| backend(format!("column {}: {}", name, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> KeystoneResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| backend(format!("serialization failed: {}", e)))
}

fn user_from_row(row: &Row) -> KeystoneResult<User> {
    Ok(User {
        user_id: col::<Uuid>(row, "user_id")?.into(),
        organization_id: col::<Uuid>(row, "organization_id")?.into(),
        email: col(row, "email")?,
        name: col(row, "name")?,
        role: col_enum(row, "role")?,
        is_active: col(row, "is_active")?,
    })
}

fn purchase_order_from_row(row: &Row) -> KeystoneResult<PurchaseOrder> {
    Ok(PurchaseOrder {
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        organization_id: col::<Uuid>(row, "organization_id")?.into(),
        project_id: col::<Uuid>(row, "project_id")?.into(),
        po_number: col(row, "po_number")?,
        supplier_name: col(row, "supplier_name")?,
        created_at: col(row, "created_at")?,
    })
}

fn shipment_from_row(row: &Row) -> KeystoneResult<Shipment> {
    Ok(Shipment {
        shipment_id: col::<Uuid>(row, "shipment_id")?.into(),
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        carrier: col(row, "carrier")?,
        tracking_number: col(row, "tracking_number")?,
        ros_date: col(row, "ros_date")?,
        supplier_aos: col(row, "supplier_aos")?,
        logistics_eta: col(row, "logistics_eta")?,
        actual_delivery_date: col(row, "actual_delivery_date")?,
        is_tracking_linked: col(row, "is_tracking_linked")?,
        status: col_enum(row, "status")?,
        is_exception: col(row, "is_exception")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn receipt_from_row(row: &Row) -> KeystoneResult<DeliveryReceipt> {
    Ok(DeliveryReceipt {
        receipt_id: col::<Uuid>(row, "receipt_id")?.into(),
        shipment_id: col::<Uuid>(row, "shipment_id")?.into(),
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        received_by: col::<Option<Uuid>>(row, "received_by")?.map(Into::into),
        received_at: col(row, "received_at")?,
        line_items: col_json(row, "line_items")?,
        variance_percent: col(row, "variance_percent")?,
        conflict_id: col::<Option<Uuid>>(row, "conflict_id")?.map(Into::into),
        notes: col(row, "notes")?,
    })
}

fn conflict_from_row(row: &Row) -> KeystoneResult<ConflictRecord> {
    Ok(ConflictRecord {
        conflict_id: col::<Uuid>(row, "conflict_id")?.into(),
        conflict_type: col_enum(row, "conflict_type")?,
        severity: col_enum(row, "severity")?,
        state: col_enum(row, "state")?,
        description: col(row, "description")?,
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        project_id: col::<Uuid>(row, "project_id")?.into(),
        shipment_id: col::<Option<Uuid>>(row, "shipment_id")?.map(Into::into),
        delivery_receipt_id: col::<Option<Uuid>>(row, "delivery_receipt_id")?.map(Into::into),
        digest_sent_at: col(row, "digest_sent_at")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
        resolved_at: col(row, "resolved_at")?,
    })
}

fn notification_from_row(row: &Row) -> KeystoneResult<Notification> {
    Ok(Notification {
        notification_id: col::<Uuid>(row, "notification_id")?.into(),
        organization_id: col::<Uuid>(row, "organization_id")?.into(),
        user_id: col::<Option<Uuid>>(row, "user_id")?.map(Into::into),
        target_role: col_enum_opt(row, "target_role")?,
        notification_type: col_enum(row, "notification_type")?,
        title: col(row, "title")?,
        message: col(row, "message")?,
        link: col(row, "link")?,
        metadata: col_json::<NotificationMetadata>(row, "metadata")?,
        created_at: col(row, "created_at")?,
        read_at: col(row, "read_at")?,
    })
}

fn invoice_from_row(row: &Row) -> KeystoneResult<Invoice> {
    Ok(Invoice {
        invoice_id: col::<Uuid>(row, "invoice_id")?.into(),
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        invoice_number: col(row, "invoice_number")?,
        amount: col(row, "amount")?,
        currency: col(row, "currency")?,
        status: col_enum(row, "status")?,
        due_date: col(row, "due_date")?,
        submitted_at: col(row, "submitted_at")?,
        paid_at: col(row, "paid_at")?,
    })
}

fn change_order_from_row(row: &Row) -> KeystoneResult<ChangeOrder> {
    Ok(ChangeOrder {
        change_order_id: col::<Uuid>(row, "change_order_id")?.into(),
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        co_number: col(row, "co_number")?,
        amount_delta: col(row, "amount_delta")?,
        status: col_enum(row, "status")?,
        submitted_at: col(row, "submitted_at")?,
    })
}

fn milestone_from_row(row: &Row) -> KeystoneResult<Milestone> {
    Ok(Milestone {
        milestone_id: col::<Uuid>(row, "milestone_id")?.into(),
        purchase_order_id: col::<Uuid>(row, "purchase_order_id")?.into(),
        title: col(row, "title")?,
        progress_percent: col(row, "progress_percent")?,
        completed_at: col(row, "completed_at")?,
        validated_at: col(row, "validated_at")?,
        expected_date: col(row, "expected_date")?,
    })
}

fn audit_from_row(row: &Row) -> KeystoneResult<AuditLogEntry> {
    Ok(AuditLogEntry {
        audit_id: col::<Uuid>(row, "audit_id")?.into(),
        organization_id: col::<Uuid>(row, "organization_id")?.into(),
        entity: EntityRef::new(col_enum(row, "entity_type")?, col(row, "entity_id")?),
        action: col(row, "action")?,
        details: col(row, "details")?,
        created_at: col(row, "created_at")?,
    })
}

fn config_from_row(row: &Row) -> KeystoneResult<ThresholdConfigEntry> {
    Ok(ThresholdConfigEntry {
        organization_id: col::<Option<Uuid>>(row, "organization_id")?.map(Into::into),
        key: col(row, "key")?,
        value: col_json::<ConfigValue>(row, "value")?,
        description: col(row, "description")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn rows<T>(rows: Vec<Row>, map: fn(&Row) -> KeystoneResult<T>) -> KeystoneResult<Vec<T>> {
    rows.iter().map(map).collect()
}

fn strs<T>(values: &[T], as_str: fn(&T) -> &'static str) -> Vec<&'static str> {
    values.iter().map(as_str).collect()
}

// ============================================================================
// POSTGRES STORAGE
// ============================================================================

/// [`Storage`] over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> KeystoneResult<Self> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn get_conn(&self) -> KeystoneResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to acquire database connection");
            backend(format!("connection pool: {}", e))
        })
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.batch_execute(SCHEMA).await.map_err(pg_err)?;
        tracing::info!("Database schema ensured");
        Ok(())
    }
}

#[async_trait]
impl Storage for PgStorage {
    // ========================================================================
    // THRESHOLD CONFIG
    // ========================================================================

    async fn config_list(
        &self,
        organization_id: Option<OrganizationId>,
    ) -> KeystoneResult<Vec<ThresholdConfigEntry>> {
        let conn = self.get_conn().await?;
        let org = organization_id.map(|id| id.as_uuid());
        let result = conn
            .query(
                "SELECT organization_id, key, value, description, updated_at \
                 FROM threshold_config \
                 WHERE organization_id IS NULL OR organization_id = $1",
                &[&org],
            )
            .await
            .map_err(pg_err)?;
        rows(result, config_from_row)
    }

    async fn config_upsert(&self, entry: &ThresholdConfigEntry) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let value = to_json(&entry.value)?;
        match entry.organization_id {
            Some(org) => conn
                .execute(
                    "INSERT INTO threshold_config (organization_id, key, value, description, updated_at) \
                     VALUES ($1, $2, $3, $4, $5) \
                     ON CONFLICT (organization_id, key) WHERE organization_id IS NOT NULL \
                     DO UPDATE SET value = EXCLUDED.value, description = EXCLUDED.description, \
                     updated_at = EXCLUDED.updated_at",
                    &[&org.as_uuid(), &entry.key, &value, &entry.description, &entry.updated_at],
                )
                .await
                .map_err(pg_err)?,
            None => conn
                .execute(
                    "INSERT INTO threshold_config (organization_id, key, value, description, updated_at) \
                     VALUES (NULL, $1, $2, $3, $4) \
                     ON CONFLICT (key) WHERE organization_id IS NULL \
                     DO UPDATE SET value = EXCLUDED.value, description = EXCLUDED.description, \
                     updated_at = EXCLUDED.updated_at",
                    &[&entry.key, &value, &entry.description, &entry.updated_at],
                )
                .await
                .map_err(pg_err)?,
        };
        Ok(())
    }

    // ========================================================================
    // TENANCY
    // ========================================================================

    async fn organization_insert(&self, org: &Organization) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO organizations (organization_id, name, created_at) VALUES ($1, $2, $3)",
            &[&org.organization_id.as_uuid(), &org.name, &org.created_at],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn organization_list(&self) -> KeystoneResult<Vec<Organization>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT organization_id, name, created_at FROM organizations ORDER BY created_at",
                &[],
            )
            .await
            .map_err(pg_err)?;
        result
            .iter()
            .map(|row| {
                Ok(Organization {
                    organization_id: col::<Uuid>(row, "organization_id")?.into(),
                    name: col(row, "name")?,
                    created_at: col(row, "created_at")?,
                })
            })
            .collect()
    }

    async fn user_insert(&self, user: &User) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO users (user_id, organization_id, email, name, role, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &user.user_id.as_uuid(),
                &user.organization_id.as_uuid(),
                &user.email,
                &user.name,
                &user.role.as_db_str(),
                &user.is_active,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn user_list_by_role(
        &self,
        organization_id: OrganizationId,
        role: UserRole,
    ) -> KeystoneResult<Vec<User>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT user_id, organization_id, email, name, role, is_active FROM users \
                 WHERE organization_id = $1 AND role = $2 AND is_active ORDER BY email",
                &[&organization_id.as_uuid(), &role.as_db_str()],
            )
            .await
            .map_err(pg_err)?;
        rows(result, user_from_row)
    }

    async fn purchase_order_insert(&self, po: &PurchaseOrder) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO purchase_orders \
             (purchase_order_id, organization_id, project_id, po_number, supplier_name, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &po.purchase_order_id.as_uuid(),
                &po.organization_id.as_uuid(),
                &po.project_id.as_uuid(),
                &po.po_number,
                &po.supplier_name,
                &po.created_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn purchase_order_get(&self, id: PurchaseOrderId) -> KeystoneResult<Option<PurchaseOrder>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM purchase_orders WHERE purchase_order_id = $1",
                &[&id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        row.as_ref().map(purchase_order_from_row).transpose()
    }

    async fn purchase_order_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<PurchaseOrder>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT * FROM purchase_orders WHERE organization_id = $1 ORDER BY created_at",
                &[&organization_id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        rows(result, purchase_order_from_row)
    }

    // ========================================================================
    // SHIPMENTS AND RECEIPTS
    // ========================================================================

    async fn shipment_insert(&self, s: &Shipment) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO shipments (shipment_id, purchase_order_id, carrier, tracking_number, \
             ros_date, supplier_aos, logistics_eta, actual_delivery_date, is_tracking_linked, \
             status, is_exception, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            &[
                &s.shipment_id.as_uuid(),
                &s.purchase_order_id.as_uuid(),
                &s.carrier,
                &s.tracking_number,
                &s.ros_date,
                &s.supplier_aos,
                &s.logistics_eta,
                &s.actual_delivery_date,
                &s.is_tracking_linked,
                &s.status.as_db_str(),
                &s.is_exception,
                &s.created_at,
                &s.updated_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn shipment_get(&self, id: ShipmentId) -> KeystoneResult<Option<Shipment>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt("SELECT * FROM shipments WHERE shipment_id = $1", &[&id.as_uuid()])
            .await
            .map_err(pg_err)?;
        row.as_ref().map(shipment_from_row).transpose()
    }

    async fn shipment_update(&self, id: ShipmentId, update: ShipmentUpdate) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let status = update.status.as_ref().map(|s| s.as_db_str());
        let updated = conn
            .execute(
                "UPDATE shipments SET \
                 carrier = COALESCE($2, carrier), \
                 tracking_number = COALESCE($3, tracking_number), \
                 status = COALESCE($4, status), \
                 supplier_aos = COALESCE($5, supplier_aos), \
                 logistics_eta = COALESCE($6, logistics_eta), \
                 actual_delivery_date = COALESCE($7, actual_delivery_date), \
                 is_tracking_linked = COALESCE($8, is_tracking_linked), \
                 is_exception = COALESCE($9, is_exception), \
                 updated_at = now() \
                 WHERE shipment_id = $1",
                &[
                    &id.as_uuid(),
                    &update.carrier,
                    &update.tracking_number,
                    &status,
                    &update.supplier_aos,
                    &update.logistics_eta,
                    &update.actual_delivery_date,
                    &update.is_tracking_linked,
                    &update.is_exception,
                ],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(not_found(EntityType::Shipment, id.as_uuid()));
        }
        Ok(())
    }

    async fn shipment_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Shipment>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT s.* FROM shipments s \
                 JOIN purchase_orders po ON po.purchase_order_id = s.purchase_order_id \
                 WHERE po.organization_id = $1 ORDER BY s.created_at, s.shipment_id",
                &[&organization_id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        rows(result, shipment_from_row)
    }

    async fn delivery_receipt_insert(&self, r: &DeliveryReceipt) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let line_items = to_json(&r.line_items)?;
        conn.execute(
            "INSERT INTO delivery_receipts (receipt_id, shipment_id, purchase_order_id, \
             received_by, received_at, line_items, variance_percent, conflict_id, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &r.receipt_id.as_uuid(),
                &r.shipment_id.as_uuid(),
                &r.purchase_order_id.as_uuid(),
                &r.received_by.map(|id| id.as_uuid()),
                &r.received_at,
                &line_items,
                &r.variance_percent,
                &r.conflict_id.map(|id| id.as_uuid()),
                &r.notes,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn delivery_receipt_get(
        &self,
        id: DeliveryReceiptId,
    ) -> KeystoneResult<Option<DeliveryReceipt>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM delivery_receipts WHERE receipt_id = $1",
                &[&id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        row.as_ref().map(receipt_from_row).transpose()
    }

    // ========================================================================
    // CONFLICTS
    // ========================================================================

    async fn conflict_insert(&self, c: &ConflictRecord) -> KeystoneResult<()> {
        let subject = c.subject().ok_or_else(|| {
            KeystoneError::from(StorageError::InsertFailed {
                entity_type: EntityType::Conflict,
                reason: format!("{} conflict without a subject", c.conflict_type),
            })
        })?;
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO conflicts (conflict_id, conflict_type, severity, state, description, \
             purchase_order_id, project_id, shipment_id, delivery_receipt_id, subject_type, \
             subject_id, digest_sent_at, created_at, updated_at, resolved_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            &[
                &c.conflict_id.as_uuid(),
                &c.conflict_type.as_db_str(),
                &c.severity.as_db_str(),
                &c.state.as_db_str(),
                &c.description,
                &c.purchase_order_id.as_uuid(),
                &c.project_id.as_uuid(),
                &c.shipment_id.map(|id| id.as_uuid()),
                &c.delivery_receipt_id.map(|id| id.as_uuid()),
                &subject.entity_type.as_db_str(),
                &subject.id,
                &c.digest_sent_at,
                &c.created_at,
                &c.updated_at,
                &c.resolved_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn conflict_get(&self, id: ConflictId) -> KeystoneResult<Option<ConflictRecord>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt("SELECT * FROM conflicts WHERE conflict_id = $1", &[&id.as_uuid()])
            .await
            .map_err(pg_err)?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn conflict_find_active(
        &self,
        subject: EntityRef,
        conflict_type: ConflictType,
    ) -> KeystoneResult<Option<ConflictRecord>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM conflicts \
                 WHERE subject_type = $1 AND subject_id = $2 AND conflict_type = $3 \
                 AND state <> 'RESOLVED'",
                &[
                    &subject.entity_type.as_db_str(),
                    &subject.id,
                    &conflict_type.as_db_str(),
                ],
            )
            .await
            .map_err(pg_err)?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn conflict_update(&self, id: ConflictId, update: ConflictUpdate) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let severity = update.severity.as_ref().map(|s| s.as_db_str());
        let state = update.state.as_ref().map(|s| s.as_db_str());
        let updated = conn
            .execute(
                "UPDATE conflicts SET \
                 severity = COALESCE($2, severity), \
                 state = COALESCE($3, state), \
                 description = COALESCE($4, description), \
                 resolved_at = COALESCE($5, resolved_at), \
                 updated_at = now() \
                 WHERE conflict_id = $1",
                &[&id.as_uuid(), &severity, &state, &update.description, &update.resolved_at],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(not_found(EntityType::Conflict, id.as_uuid()));
        }
        Ok(())
    }

    async fn conflict_list(&self, filter: &ConflictFilter) -> KeystoneResult<Vec<ConflictRecord>> {
        let conn = self.get_conn().await?;
        let states = strs(&filter.states, ConflictState::as_db_str);
        let severities = strs(&filter.severities, ConflictSeverity::as_db_str);
        let types = strs(&filter.conflict_types, ConflictType::as_db_str);
        let purchase_orders: Vec<Uuid> =
            filter.purchase_order_ids.iter().map(|id| id.as_uuid()).collect();
        let subject_type = filter.subject.map(|s| s.entity_type.as_db_str());
        let subject_id = filter.subject.map(|s| s.id);

        let result = conn
            .query(
                "SELECT * FROM conflicts WHERE \
                 (cardinality($1::text[]) = 0 OR state = ANY($1)) \
                 AND (cardinality($2::text[]) = 0 OR severity = ANY($2)) \
                 AND (cardinality($3::text[]) = 0 OR conflict_type = ANY($3)) \
                 AND (cardinality($4::uuid[]) = 0 OR purchase_order_id = ANY($4)) \
                 AND ($5::text IS NULL OR (subject_type = $5 AND subject_id = $6)) \
                 AND ($7::timestamptz IS NULL OR digest_sent_at IS NULL OR digest_sent_at < $7) \
                 ORDER BY created_at, conflict_id",
                &[
                    &states,
                    &severities,
                    &types,
                    &purchase_orders,
                    &subject_type,
                    &subject_id,
                    &filter.digest_not_sent_since,
                ],
            )
            .await
            .map_err(pg_err)?;
        rows(result, conflict_from_row)
    }

    async fn conflict_mark_digest_sent(
        &self,
        ids: &[ConflictId],
        at: Timestamp,
    ) -> KeystoneResult<u64> {
        let conn = self.get_conn().await?;
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        conn.execute(
            "UPDATE conflicts SET digest_sent_at = $2 WHERE conflict_id = ANY($1)",
            &[&ids, &at],
        )
        .await
        .map_err(pg_err)
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    async fn notification_insert(&self, n: &Notification) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let metadata = to_json(&n.metadata)?;
        let key = n.dedupe_key();
        conn.execute(
            "INSERT INTO notifications (notification_id, organization_id, user_id, target_role, \
             notification_type, title, message, link, entity_type, entity_id, escalation_level, \
             metadata, created_at, created_day, read_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            &[
                &n.notification_id.as_uuid(),
                &n.organization_id.as_uuid(),
                &n.user_id.map(|id| id.as_uuid()),
                &n.target_role.as_ref().map(|r| r.as_db_str()),
                &n.notification_type.as_db_str(),
                &n.title,
                &n.message,
                &n.link,
                &key.entity.entity_type.as_db_str(),
                &key.entity.id,
                &key.level.ordinal(),
                &metadata,
                &n.created_at,
                &key.day,
                &n.read_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn notification_exists_since(
        &self,
        entity: EntityRef,
        level: EscalationLevel,
        since: Timestamp,
    ) -> KeystoneResult<bool> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM notifications \
                 WHERE entity_type = $1 AND entity_id = $2 AND escalation_level = $3 \
                 AND created_at >= $4)",
                &[&entity.entity_type.as_db_str(), &entity.id, &level.ordinal(), &since],
            )
            .await
            .map_err(pg_err)?;
        row.try_get(0).map_err(pg_err)
    }

    async fn notification_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Notification>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT * FROM notifications WHERE organization_id = $1 \
                 ORDER BY created_at DESC, notification_id DESC",
                &[&organization_id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        rows(result, notification_from_row)
    }

    // ========================================================================
    // ESCALATION SUBJECTS
    // ========================================================================

    async fn invoice_insert(&self, i: &Invoice) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO invoices (invoice_id, purchase_order_id, invoice_number, amount, \
             currency, status, due_date, submitted_at, paid_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &i.invoice_id.as_uuid(),
                &i.purchase_order_id.as_uuid(),
                &i.invoice_number,
                &i.amount,
                &i.currency,
                &i.status.as_db_str(),
                &i.due_date,
                &i.submitted_at,
                &i.paid_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn invoice_get(&self, id: InvoiceId) -> KeystoneResult<Option<Invoice>> {
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt("SELECT * FROM invoices WHERE invoice_id = $1", &[&id.as_uuid()])
            .await
            .map_err(pg_err)?;
        row.as_ref().map(invoice_from_row).transpose()
    }

    async fn invoice_list_overdue(
        &self,
        statuses: &[InvoiceStatus],
        due_before: Date,
    ) -> KeystoneResult<Vec<Invoice>> {
        let conn = self.get_conn().await?;
        let statuses = strs(statuses, InvoiceStatus::as_db_str);
        let result = conn
            .query(
                "SELECT * FROM invoices WHERE status = ANY($1) AND due_date < $2 \
                 ORDER BY due_date, invoice_id",
                &[&statuses, &due_before],
            )
            .await
            .map_err(pg_err)?;
        rows(result, invoice_from_row)
    }

    async fn invoice_list_by_organization(
        &self,
        organization_id: OrganizationId,
    ) -> KeystoneResult<Vec<Invoice>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT i.* FROM invoices i \
                 JOIN purchase_orders po ON po.purchase_order_id = i.purchase_order_id \
                 WHERE po.organization_id = $1 ORDER BY i.submitted_at, i.invoice_id",
                &[&organization_id.as_uuid()],
            )
            .await
            .map_err(pg_err)?;
        rows(result, invoice_from_row)
    }

    async fn invoice_update_status(&self, id: InvoiceId, status: InvoiceStatus) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        let updated = conn
            .execute(
                "UPDATE invoices SET status = $2 WHERE invoice_id = $1",
                &[&id.as_uuid(), &status.as_db_str()],
            )
            .await
            .map_err(pg_err)?;
        if updated == 0 {
            return Err(not_found(EntityType::Invoice, id.as_uuid()));
        }
        Ok(())
    }

    async fn change_order_insert(&self, co: &ChangeOrder) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO change_orders (change_order_id, purchase_order_id, co_number, \
             amount_delta, status, submitted_at) VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &co.change_order_id.as_uuid(),
                &co.purchase_order_id.as_uuid(),
                &co.co_number,
                &co.amount_delta,
                &co.status.as_db_str(),
                &co.submitted_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn change_order_list_pending(&self) -> KeystoneResult<Vec<ChangeOrder>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT * FROM change_orders \
                 WHERE status IN ('SUBMITTED', 'UNDER_REVIEW') AND submitted_at IS NOT NULL \
                 ORDER BY submitted_at, change_order_id",
                &[],
            )
            .await
            .map_err(pg_err)?;
        rows(result, change_order_from_row)
    }

    async fn milestone_insert(&self, m: &Milestone) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO milestones (milestone_id, purchase_order_id, title, progress_percent, \
             completed_at, validated_at, expected_date) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &m.milestone_id.as_uuid(),
                &m.purchase_order_id.as_uuid(),
                &m.title,
                &m.progress_percent,
                &m.completed_at,
                &m.validated_at,
                &m.expected_date,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn milestone_list_awaiting_validation(&self) -> KeystoneResult<Vec<Milestone>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT * FROM milestones \
                 WHERE progress_percent >= 100 AND completed_at IS NOT NULL \
                 AND validated_at IS NULL \
                 ORDER BY completed_at, milestone_id",
                &[],
            )
            .await
            .map_err(pg_err)?;
        rows(result, milestone_from_row)
    }

    // ========================================================================
    // AUDIT
    // ========================================================================

    async fn audit_log_insert(&self, entry: &AuditLogEntry) -> KeystoneResult<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO audit_log (audit_id, organization_id, entity_type, entity_id, action, \
             details, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &entry.audit_id.as_uuid(),
                &entry.organization_id.as_uuid(),
                &entry.entity.entity_type.as_db_str(),
                &entry.entity.id,
                &entry.action,
                &entry.details,
                &entry.created_at,
            ],
        )
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn audit_log_list_by_entity(&self, entity: EntityRef) -> KeystoneResult<Vec<AuditLogEntry>> {
        let conn = self.get_conn().await?;
        let result = conn
            .query(
                "SELECT * FROM audit_log WHERE entity_type = $1 AND entity_id = $2 \
                 ORDER BY created_at, audit_id",
                &[&entity.entity_type.as_db_str(), &entity.id],
            )
            .await
            .map_err(pg_err)?;
        rows(result, audit_from_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_storage::{CONFLICT_ACTIVE_CONSTRAINT, NOTIFICATION_DEDUPE_CONSTRAINT};

    #[test]
    fn test_db_config_default() {
        let config = DbConfig::default();
        assert_eq!(config.host, DEFAULT_DB_HOST);
        assert_eq!(config.port, DEFAULT_DB_PORT);
        assert_eq!(config.dbname, "keystone");
        assert_eq!(config.max_size, DEFAULT_DB_POOL_SIZE);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS));
    }

    #[test]
    fn test_schema_declares_uniqueness_backstops() {
        assert!(SCHEMA.contains(&format!("UNIQUE INDEX IF NOT EXISTS {}", CONFLICT_ACTIVE_CONSTRAINT)));
        assert!(SCHEMA.contains(&format!("UNIQUE INDEX IF NOT EXISTS {}", NOTIFICATION_DEDUPE_CONSTRAINT)));
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        // No connection is attempted until the first checkout
        let storage = PgStorage::from_config(&DbConfig::default()).unwrap();
        assert_eq!(storage.pool_size(), 0);
    }
}
