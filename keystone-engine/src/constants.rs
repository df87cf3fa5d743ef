//! Constants for the Keystone engine
//!
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// DATABASE
// ============================================================================

pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "keystone";
pub const DEFAULT_DB_USER: &str = "postgres";
pub const DEFAULT_DB_POOL_SIZE: usize = 16;
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// JOBS
// ============================================================================

/// Escalation scan interval (1 hour)
pub const DEFAULT_ESCALATION_INTERVAL_SECS: u64 = 3600;

/// Conflict digest interval (24 hours)
pub const DEFAULT_DIGEST_INTERVAL_SECS: u64 = 86400;

// ============================================================================
// MAILER
// ============================================================================

/// Default timeout for the digest relay HTTP call
pub const DEFAULT_MAILER_TIMEOUT_SECS: u64 = 15;

pub const MAILER_USER_AGENT: &str = "Keystone-Digest/1.0";

// ============================================================================
// LOGGING
// ============================================================================

pub const DEFAULT_LOG_FILTER: &str = "keystone_engine=info,info";

pub const SERVICE_NAME: &str = "keystone-engine";

// ============================================================================
// LINKS
// ============================================================================

/// Relative links embedded in notifications.
pub const CONFLICTS_LINK: &str = "/conflicts";
pub const INVOICES_LINK: &str = "/invoices";
pub const CHANGE_ORDERS_LINK: &str = "/change-orders";
pub const MILESTONES_LINK: &str = "/milestones";
