//! Keystone Core - Entity Types
//!
//! Pure data structures for the procurement conflict engine. All other crates
//! depend on this. Classification helpers live here only when they are pure
//! functions of entity fields and configuration.

mod config;
mod entities;
mod enums;
mod error;
mod filter;
mod identity;
mod mailer;

pub use config::*;
pub use entities::*;
pub use enums::*;
pub use error::*;
pub use filter::*;
pub use identity::*;
pub use mailer::*;

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Line variance is never negative and is symmetric around the declaration.
        #[test]
        fn prop_line_variance_symmetric(declared in 0.1f64..10_000.0, delta in 0.0f64..5_000.0) {
            let over = DeliveryLineItem {
                boq_item_id: BoqItemId::nil(),
                description: String::new(),
                declared_quantity: declared,
                delivered_quantity: declared + delta,
            };
            let under = DeliveryLineItem {
                delivered_quantity: (declared - delta).max(0.0),
                ..over.clone()
            };
            prop_assert!(over.variance_percent() >= 0.0);
            if delta <= declared {
                prop_assert!((over.variance_percent() - under.variance_percent()).abs() < 1e-6);
            }
        }

        /// Exact delivery never produces a variance.
        #[test]
        fn prop_exact_delivery_zero_variance(declared in 0.0f64..10_000.0) {
            let item = DeliveryLineItem {
                boq_item_id: BoqItemId::nil(),
                description: String::new(),
                declared_quantity: declared,
                delivered_quantity: declared,
            };
            prop_assert_eq!(item.variance_percent(), 0.0);
        }

        /// More elapsed days never lowers the escalation level.
        #[test]
        fn prop_ladder_monotonic(
            reminder in 0i64..30,
            pm in 0i64..60,
            finance in 0i64..90,
            days in 0i64..200,
        ) {
            let ladder = EscalationLadder::new([
                (reminder, EscalationLevel::Reminder),
                (pm, EscalationLevel::Pm),
                (finance, EscalationLevel::Finance),
            ]);
            prop_assert!(ladder.level_for(days) <= ladder.level_for(days + 1));
        }

        /// The HIGH delay cut-off is never below the tolerance.
        #[test]
        fn prop_delay_thresholds_ordered(tolerance in 0u32..100, high in 0u32..100) {
            let mut config = ThresholdConfig::defaults();
            config.set(ConfigKey::DelayToleranceDays, ConfigValue::Number(tolerance as f64)).unwrap();
            config.set(ConfigKey::HighDelayDays, ConfigValue::Number(high as f64)).unwrap();
            let t = config.delay_thresholds();
            prop_assert!(t.high_delay_days >= t.tolerance_days);
            prop_assert_eq!(t.tolerance_days, tolerance as i64);
        }
    }
}
