//! Identity types for Keystone entities

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::EntityType;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Calendar date without a time component (ROS, AOS, due dates).
pub type Date = NaiveDate;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Common behavior of the strongly-typed entity identifiers.
pub trait EntityIdType:
    Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Entity type this identifier addresses.
    const ENTITY_TYPE: EntityType;

    /// Wrap a raw UUID.
    fn new(uuid: Uuid) -> Self;

    /// Raw UUID value.
    fn as_uuid(&self) -> Uuid;

    /// Generate a fresh UUIDv7 identifier.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Typed reference to this entity.
    fn entity_ref(&self) -> crate::EntityRef {
        crate::EntityRef::new(Self::ENTITY_TYPE, self.as_uuid())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident => $entity:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap a raw UUID.
            pub const fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a fresh UUIDv7 identifier.
            pub fn now_v7() -> Self {
                Self(Uuid::now_v7())
            }

            /// The nil identifier.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            /// Raw UUID value.
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl EntityIdType for $name {
            const ENTITY_TYPE: EntityType = EntityType::$entity;

            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_entity_id!(
    /// Tenant (organization) identifier.
    OrganizationId => Organization
);
define_entity_id!(
    /// Project identifier (projects group purchase orders).
    ProjectId => Project
);
define_entity_id!(
    /// Platform user identifier.
    UserId => User
);
define_entity_id!(PurchaseOrderId => PurchaseOrder);
define_entity_id!(ShipmentId => Shipment);
define_entity_id!(DeliveryReceiptId => DeliveryReceipt);
define_entity_id!(
    /// Bill-of-quantities line identifier.
    BoqItemId => BoqItem
);
define_entity_id!(ConflictId => Conflict);
define_entity_id!(NotificationId => Notification);
define_entity_id!(InvoiceId => Invoice);
define_entity_id!(ChangeOrderId => ChangeOrder);
define_entity_id!(MilestoneId => Milestone);
define_entity_id!(AuditLogId => AuditLog);

// ============================================================================
// DAY ARITHMETIC
// ============================================================================

/// Midnight UTC at the start of the calendar day containing `at`.
pub fn start_of_day(at: Timestamp) -> Timestamp {
    Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::MIN))
}

/// Whole calendar days from `from` to `to` (negative when `to` is earlier).
pub fn days_between(from: Date, to: Date) -> i64 {
    (to - from).num_days()
}

/// Whole elapsed days (floored) between two timestamps, never negative.
pub fn elapsed_days(since: Timestamp, now: Timestamp) -> i64 {
    (now - since).num_days().max(0)
}

/// Rolling 24-hour window start used by notification deduplication.
pub fn dedupe_window_start(now: Timestamp) -> Timestamp {
    now - Duration::hours(24)
}
