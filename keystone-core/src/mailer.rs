//! Outbound digest delivery types.
//!
//! The transport itself (SMTP, HTTP relay, templating) is an external
//! collaborator; the engine only hands it a [`UserDigest`].

use crate::{
    ConflictId, ConflictSeverity, ConflictState, ConflictType, NotificationError, OrganizationId,
    PurchaseOrderId, Timestamp, UserId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Conflicts listed individually in a digest summary.
pub const DIGEST_LIST_LIMIT: usize = 10;

/// One conflict line of a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestConflict {
    pub conflict_id: ConflictId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub state: ConflictState,
    pub description: String,
    pub purchase_order_id: PurchaseOrderId,
    pub po_number: String,
    pub created_at: Timestamp,
}

/// Everything one recipient receives in a daily digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDigest {
    pub user_id: UserId,
    pub email: String,
    pub name: String,
    pub organization_id: OrganizationId,
    pub conflicts: Vec<DigestConflict>,
}

impl UserDigest {
    pub fn subject(&self) -> String {
        match self.conflicts.len() {
            1 => "1 open procurement conflict needs review".to_string(),
            n => format!("{} open procurement conflicts need review", n),
        }
    }

    /// Plain-text summary listing at most [`DIGEST_LIST_LIMIT`] conflicts,
    /// followed by a `+N more` line for the remainder.
    pub fn render_summary(&self) -> String {
        let mut body = format!("Hello {},\n\n{}:\n", self.name, self.subject());
        for c in self.conflicts.iter().take(DIGEST_LIST_LIMIT) {
            let _ = writeln!(
                body,
                "- [{}] {} on PO {}: {}",
                c.severity, c.conflict_type, c.po_number, c.description
            );
        }
        let hidden = self.conflicts.len().saturating_sub(DIGEST_LIST_LIMIT);
        if hidden > 0 {
            let _ = writeln!(body, "+{} more", hidden);
        }
        body
    }
}

/// Delivery of digest summaries to a recipient.
#[async_trait]
pub trait DigestMailer: Send + Sync {
    /// Deliver one digest. An error marks only this recipient as failed.
    async fn send_digest(&self, digest: &UserDigest) -> Result<(), NotificationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn digest(count: usize) -> UserDigest {
        let conflicts = (0..count)
            .map(|i| DigestConflict {
                conflict_id: ConflictId::now_v7(),
                conflict_type: ConflictType::Delay,
                severity: ConflictSeverity::Medium,
                state: ConflictState::Open,
                description: format!("Shipment delayed by {} days past ROS", i + 3),
                purchase_order_id: PurchaseOrderId::now_v7(),
                po_number: format!("PO-{:03}", i),
                created_at: Utc::now(),
            })
            .collect();
        UserDigest {
            user_id: UserId::now_v7(),
            email: "pm@example.com".to_string(),
            name: "Dana".to_string(),
            organization_id: OrganizationId::now_v7(),
            conflicts,
        }
    }

    #[test]
    fn test_summary_lists_all_when_under_limit() {
        let body = digest(3).render_summary();
        assert_eq!(body.matches("\n- [").count(), 3);
        assert!(!body.contains("more"));
        assert!(body.contains("3 open procurement conflicts"));
    }

    #[test]
    fn test_summary_caps_at_limit() {
        let body = digest(14).render_summary();
        assert_eq!(body.matches("\n- [").count(), DIGEST_LIST_LIMIT);
        assert!(body.contains("+4 more"));
        assert!(!body.contains("PO-010"));
    }

    #[test]
    fn test_subject_singular() {
        assert_eq!(digest(1).subject(), "1 open procurement conflict needs review");
    }
}
