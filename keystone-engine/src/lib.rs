//! Keystone Engine - Conflict Detection and Escalation
//!
//! Detects schedule delays and quantity variances on purchase orders, records
//! them as conflicts, escalates stale invoices, change orders and milestones
//! along configurable ladders, and mails a daily digest of open conflicts.
//!
//! Everything here is written against the `keystone_storage::Storage` trait;
//! [`db::PgStorage`] is the PostgreSQL implementation.

pub mod constants;
pub mod db;
pub mod delay;
pub mod detector;
pub mod digest;
pub mod escalation;
pub mod jobs;
pub mod kpi;
pub mod mailer;
pub mod telemetry;
pub mod thresholds;
pub mod tracking;
pub mod variance;

// Re-export commonly used types
pub use db::{DbConfig, PgStorage};
pub use delay::{
    check_and_create_delay_conflict, classify_delay, delay_description, evaluate_shipment_delay,
    DelayEvaluation,
};
pub use detector::{classify_tier, DetectorAction};
pub use digest::{
    preview_next_digest, run_conflict_digest, select_digest, DigestPreview, DigestResult,
    OrganizationDigest,
};
pub use escalation::{
    process_change_order_escalations, process_invoice_escalations,
    process_milestone_escalations, run_all_escalations, EscalationOutcome, EscalationSummary,
    ScanError, ScanResult,
};
pub use jobs::{conflict_jobs_task, JobConfig, JobMetrics, JobMetricsSnapshot};
pub use kpi::{logistics_kpis, payment_kpis, LogisticsKpis, PaymentKpis};
pub use mailer::{HttpMailer, MailerConfig, TracingMailer};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use thresholds::load_thresholds;
pub use tracking::{ingest_tracking_update, IngestAck, TrackingUpdate};
pub use variance::{
    classify_variance, confirm_delivery, line_variance_percent, receipt_variance_percent,
    variance_description, ConfirmDeliveryRequest, DeliveryConfirmation,
};
