//! Threshold loading for detectors.

use keystone_core::{ConfigError, OrganizationId, ThresholdConfig};
use keystone_storage::Storage;

/// Effective thresholds for an organization (`None` for global defaults only).
///
/// Never fails: a storage error is logged and the hard-coded defaults apply.
pub async fn load_thresholds<S: Storage + ?Sized>(
    store: &S,
    organization_id: Option<OrganizationId>,
) -> ThresholdConfig {
    match store.config_list(organization_id).await {
        Ok(entries) => ThresholdConfig::from_entries(organization_id, entries),
        Err(e) => {
            let unavailable = ConfigError::Unavailable {
                reason: e.to_string(),
            };
            tracing::warn!(
                error = %unavailable,
                organization_id = ?organization_id,
                "Threshold config unavailable, using defaults"
            );
            ThresholdConfig::defaults()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keystone_core::{ConfigValue, DelayThresholds, ThresholdConfigEntry};
    use keystone_storage::MockStorage;

    #[tokio::test]
    async fn test_load_applies_org_override() {
        let store = MockStorage::new();
        let org = OrganizationId::now_v7();
        store
            .config_upsert(&ThresholdConfigEntry {
                organization_id: Some(org),
                key: "delay_tolerance_days".to_string(),
                value: ConfigValue::Number(1.0),
                description: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let config = load_thresholds(&store, Some(org)).await;
        assert_eq!(config.delay_thresholds().tolerance_days, 1);

        let other = load_thresholds(&store, Some(OrganizationId::now_v7())).await;
        assert_eq!(other.delay_thresholds(), DelayThresholds::default());
    }
}
