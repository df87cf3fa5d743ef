//! Error types for Keystone operations

use crate::EntityType;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Insert failed for {entity_type:?}: {reason}")]
    InsertFailed { entity_type: EntityType, reason: String },

    /// A uniqueness backstop rejected the write.
    #[error("Unique constraint {constraint} violated: {reason}")]
    UniqueViolation { constraint: String, reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StorageError::UniqueViolation { .. })
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown configuration key: {key}")]
    UnknownKey { key: String },

    #[error("Configuration unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Outbound notification errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("Send to {recipient} failed: {reason}")]
    SendFailed { recipient: String, reason: String },
}

/// Master error type for all Keystone errors.
#[derive(Debug, Clone, Error)]
pub enum KeystoneError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Notification error: {0}")]
    Notification(#[from] NotificationError),
}

impl KeystoneError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KeystoneError::Storage(e) if e.is_not_found())
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, KeystoneError::Storage(e) if e.is_unique_violation())
    }
}

/// Result type alias for Keystone operations.
pub type KeystoneResult<T> = Result<T, KeystoneError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_not_found() {
        let err = StorageError::NotFound {
            entity_type: EntityType::Shipment,
            id: Uuid::nil(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("Shipment"));
    }

    #[test]
    fn test_unique_violation_display() {
        let err = StorageError::UniqueViolation {
            constraint: "conflicts_one_active".to_string(),
            reason: "active conflict exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unique constraint conflicts_one_active violated: active conflict exists"
        );
    }

    #[test]
    fn test_master_error_wraps_with_prefix() {
        let err: KeystoneError = ValidationError::InvalidValue {
            field: "delivered_quantity".to_string(),
            reason: "must not be negative".to_string(),
        }
        .into();
        assert!(err.to_string().starts_with("Validation error: "));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_master_error_classification() {
        let not_found: KeystoneError = StorageError::NotFound {
            entity_type: EntityType::Invoice,
            id: Uuid::nil(),
        }
        .into();
        assert!(not_found.is_not_found());

        let dup: KeystoneError = StorageError::UniqueViolation {
            constraint: "notifications_dedupe".to_string(),
            reason: "exists".to_string(),
        }
        .into();
        assert!(dup.is_unique_violation());
        assert!(!dup.is_not_found());
    }

    #[test]
    fn test_notification_error_display() {
        let err = NotificationError::SendFailed {
            recipient: "pm@example.com".to_string(),
            reason: "timeout".to_string(),
        };
        assert_eq!(err.to_string(), "Send to pm@example.com failed: timeout");
    }
}
