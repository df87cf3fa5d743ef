//! Enum types for Keystone entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Generates the database string conversions shared by every status enum:
/// `as_db_str`, `from_db_str`, `Display` and `FromStr`.
///
/// Parsing is case-insensitive and ignores `_`, `-` and whitespace, so
/// `"IN_TRANSIT"`, `"in-transit"` and `"InTransit"` all parse.
macro_rules! db_enum {
    ($name:ident, $label:literal { $($variant:ident => $db:literal),+ $(,)? }) => {
        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Convert to database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $db),+
                }
            }

            /// Parse from database string representation.
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                let token = normalize_token(s);
                $(
                    if token == normalize_token($db) {
                        return Ok($name::$variant);
                    }
                )+
                Err(EnumParseError { kind: $label, value: s.to_string() })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ============================================================================
// CORE ENUMS
// ============================================================================

/// Entity type discriminator for polymorphic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Organization,
    Project,
    User,
    PurchaseOrder,
    Shipment,
    DeliveryReceipt,
    BoqItem,
    Conflict,
    Notification,
    Invoice,
    ChangeOrder,
    Milestone,
    AuditLog,
}

db_enum!(EntityType, "entity type" {
    Organization => "ORGANIZATION",
    Project => "PROJECT",
    User => "USER",
    PurchaseOrder => "PURCHASE_ORDER",
    Shipment => "SHIPMENT",
    DeliveryReceipt => "DELIVERY_RECEIPT",
    BoqItem => "BOQ_ITEM",
    Conflict => "CONFLICT",
    Notification => "NOTIFICATION",
    Invoice => "INVOICE",
    ChangeOrder => "CHANGE_ORDER",
    Milestone => "MILESTONE",
    AuditLog => "AUDIT_LOG",
});

/// Lifecycle status of a shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    #[default]
    Pending,
    Dispatched,
    InTransit,
    OutForDelivery,
    Delivered,
    PartiallyDelivered,
    Failed,
    Exception,
}

db_enum!(ShipmentStatus, "shipment status" {
    Pending => "PENDING",
    Dispatched => "DISPATCHED",
    InTransit => "IN_TRANSIT",
    OutForDelivery => "OUT_FOR_DELIVERY",
    Delivered => "DELIVERED",
    PartiallyDelivered => "PARTIALLY_DELIVERED",
    Failed => "FAILED",
    Exception => "EXCEPTION",
});

impl ShipmentStatus {
    /// Whether goods have (at least partly) arrived on site.
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            ShipmentStatus::Delivered | ShipmentStatus::PartiallyDelivered
        )
    }

    /// Whether the shipment is moving between origin and site.
    pub fn is_in_transit(&self) -> bool {
        matches!(
            self,
            ShipmentStatus::Dispatched | ShipmentStatus::InTransit | ShipmentStatus::OutForDelivery
        )
    }
}

// ============================================================================
// CONFLICT ENUMS
// ============================================================================

/// Kind of discrepancy a conflict records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// Arrival later than required-on-site
    Delay,
    /// Delivered quantities differ from declared quantities
    QuantityVariance,
}

db_enum!(ConflictType, "conflict type" {
    Delay => "DELAY",
    QuantityVariance => "QUANTITY_VARIANCE",
});

/// Severity of a conflict. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

db_enum!(ConflictSeverity, "conflict severity" {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
});

impl ConflictSeverity {
    /// Severities delivered through the daily digest instead of immediate alerts.
    pub const DIGESTIBLE: [ConflictSeverity; 2] = [ConflictSeverity::Low, ConflictSeverity::Medium];
}

/// Review state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictState {
    #[default]
    Open,
    Review,
    Resolved,
    Escalated,
}

db_enum!(ConflictState, "conflict state" {
    Open => "OPEN",
    Review => "REVIEW",
    Resolved => "RESOLVED",
    Escalated => "ESCALATED",
});

impl ConflictState {
    /// States counted by the "one active conflict per subject and type" rule.
    pub const ACTIVE: [ConflictState; 3] = [
        ConflictState::Open,
        ConflictState::Review,
        ConflictState::Escalated,
    ];

    /// States eligible for the daily digest.
    pub const DIGESTIBLE: [ConflictState; 2] = [ConflictState::Open, ConflictState::Review];

    /// Check if the conflict still needs attention.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConflictState::Resolved)
    }
}

// ============================================================================
// ESCALATION ENUMS
// ============================================================================

/// Ordinal escalation level reached by an overdue entity.
///
/// `None(0) < Reminder(1) < Pm(2) < Executive(3) < Finance(4)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationLevel {
    #[default]
    None,
    Reminder,
    Pm,
    Executive,
    Finance,
}

db_enum!(EscalationLevel, "escalation level" {
    None => "NONE",
    Reminder => "REMINDER",
    Pm => "PM",
    Executive => "EXECUTIVE",
    Finance => "FINANCE",
});

impl EscalationLevel {
    /// Ordinal value stored alongside notifications.
    pub fn ordinal(&self) -> i16 {
        match self {
            EscalationLevel::None => 0,
            EscalationLevel::Reminder => 1,
            EscalationLevel::Pm => 2,
            EscalationLevel::Executive => 3,
            EscalationLevel::Finance => 4,
        }
    }

    /// Inverse of [`EscalationLevel::ordinal`].
    pub fn from_ordinal(value: i16) -> Option<Self> {
        match value {
            0 => Some(EscalationLevel::None),
            1 => Some(EscalationLevel::Reminder),
            2 => Some(EscalationLevel::Pm),
            3 => Some(EscalationLevel::Executive),
            4 => Some(EscalationLevel::Finance),
            _ => None,
        }
    }

    /// Role that receives notifications at this level.
    pub fn target_role(&self) -> Option<UserRole> {
        match self {
            EscalationLevel::None => None,
            EscalationLevel::Reminder | EscalationLevel::Pm => Some(UserRole::Pm),
            EscalationLevel::Executive => Some(UserRole::Executive),
            EscalationLevel::Finance => Some(UserRole::Finance),
        }
    }

    /// Reminders nudge the owner; everything above routes to someone else.
    pub fn is_escalation(&self) -> bool {
        *self > EscalationLevel::Reminder
    }
}

// ============================================================================
// FINANCIAL ENUMS
// ============================================================================

/// Approval/payment status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    PendingApproval,
    Approved,
    Pending,
    PartiallyPaid,
    Paid,
    Overdue,
    Rejected,
}

db_enum!(InvoiceStatus, "invoice status" {
    Draft => "DRAFT",
    PendingApproval => "PENDING_APPROVAL",
    Approved => "APPROVED",
    Pending => "PENDING",
    PartiallyPaid => "PARTIALLY_PAID",
    Paid => "PAID",
    Overdue => "OVERDUE",
    Rejected => "REJECTED",
});

impl InvoiceStatus {
    /// Statuses scanned for payment escalation once the due date has passed.
    pub const ESCALATION_ELIGIBLE: [InvoiceStatus; 3] = [
        InvoiceStatus::Pending,
        InvoiceStatus::PartiallyPaid,
        InvoiceStatus::Overdue,
    ];
}

/// Review status of a change order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOrderStatus {
    Draft,
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

db_enum!(ChangeOrderStatus, "change order status" {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    UnderReview => "UNDER_REVIEW",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

impl ChangeOrderStatus {
    /// Statuses awaiting a decision.
    pub const PENDING: [ChangeOrderStatus; 2] =
        [ChangeOrderStatus::Submitted, ChangeOrderStatus::UnderReview];
}

// ============================================================================
// USERS AND NOTIFICATIONS
// ============================================================================

/// Role of a platform user within an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    Pm,
    Executive,
    Finance,
    Supplier,
    Viewer,
}

db_enum!(UserRole, "user role" {
    Admin => "ADMIN",
    Pm => "PM",
    Executive => "EXECUTIVE",
    Finance => "FINANCE",
    Supplier => "SUPPLIER",
    Viewer => "VIEWER",
});

/// Kind of notification shown in the notification center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    InvoiceOverdue,
    ChangeOrderPending,
    MilestoneValidation,
    ConflictAlert,
    ConflictDigest,
}

db_enum!(NotificationType, "notification type" {
    InvoiceOverdue => "INVOICE_OVERDUE",
    ChangeOrderPending => "CHANGE_ORDER_PENDING",
    MilestoneValidation => "MILESTONE_VALIDATION",
    ConflictAlert => "CONFLICT_ALERT",
    ConflictDigest => "CONFLICT_DIGEST",
});

/// Source system of a tracking update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Carrier {
    Maersk,
    Dhl,
    AfterShip,
    Manual,
}

db_enum!(Carrier, "carrier" {
    Maersk => "MAERSK",
    Dhl => "DHL",
    AfterShip => "AFTERSHIP",
    Manual => "MANUAL",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipment_status_parse_accepts_variants() {
        assert_eq!(
            ShipmentStatus::from_db_str("IN_TRANSIT").unwrap(),
            ShipmentStatus::InTransit
        );
        assert_eq!(
            ShipmentStatus::from_db_str("out-for-delivery").unwrap(),
            ShipmentStatus::OutForDelivery
        );
        assert_eq!(
            "PartiallyDelivered".parse::<ShipmentStatus>().unwrap(),
            ShipmentStatus::PartiallyDelivered
        );
    }

    #[test]
    fn test_parse_error_names_kind() {
        let err = ConflictSeverity::from_db_str("critical").unwrap_err();
        assert_eq!(err.kind, "conflict severity");
        assert_eq!(err.to_string(), "Invalid conflict severity: critical");
    }

    #[test]
    fn test_db_str_round_trip_all_variants() {
        for status in InvoiceStatus::ALL {
            assert_eq!(InvoiceStatus::from_db_str(status.as_db_str()).unwrap(), *status);
        }
        for level in EscalationLevel::ALL {
            assert_eq!(EscalationLevel::from_ordinal(level.ordinal()), Some(*level));
        }
    }

    #[test]
    fn test_escalation_levels_are_strictly_ordered() {
        let levels = EscalationLevel::ALL;
        for pair in levels.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].ordinal() < pair[1].ordinal());
        }
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ConflictSeverity::Low < ConflictSeverity::Medium);
        assert!(ConflictSeverity::Medium < ConflictSeverity::High);
    }

    #[test]
    fn test_conflict_state_activity() {
        assert!(ConflictState::Open.is_active());
        assert!(ConflictState::Escalated.is_active());
        assert!(!ConflictState::Resolved.is_active());
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&ShipmentStatus::OutForDelivery).unwrap();
        assert_eq!(json, "\"OUT_FOR_DELIVERY\"");
        let json = serde_json::to_string(&ConflictType::QuantityVariance).unwrap();
        assert_eq!(json, "\"QUANTITY_VARIANCE\"");
    }
}
