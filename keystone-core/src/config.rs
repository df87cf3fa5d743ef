//! Threshold configuration
//!
//! Policy values (delay tolerance, variance percent, escalation day counts)
//! are stored per organization with optional global default rows. Every key
//! the engine reads is declared in [`ConfigKey`] with a static type and a
//! hard-coded fallback, so a missing or malformed row never blocks a detector.

use crate::{ConfigError, EscalationLevel, OrganizationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// VALUES
// ============================================================================

/// Typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

/// Static type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigValueKind {
    Bool,
    Number,
    Text,
}

impl ConfigValue {
    pub fn kind(&self) -> ConfigValueKind {
        match self {
            ConfigValue::Bool(_) => ConfigValueKind::Bool,
            ConfigValue::Number(_) => ConfigValueKind::Number,
            ConfigValue::Text(_) => ConfigValueKind::Text,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Number(n) => write!(f, "{}", n),
            ConfigValue::Text(s) => f.write_str(s),
        }
    }
}

/// Conversion from a stored value into a concrete Rust type.
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &ConfigValue) -> Option<Self>;
}

impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Number(n) if n.is_finite() => Some(*n),
            ConfigValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }
}

impl FromConfigValue for i64 {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        let n = f64::from_config_value(value)?;
        if n.fract() != 0.0 || n < i64::MIN as f64 || n > i64::MAX as f64 {
            return None;
        }
        Some(n as i64)
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            ConfigValue::Number(_) => None,
        }
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue) -> Option<Self> {
        Some(value.to_string())
    }
}

// ============================================================================
// KEY REGISTRY
// ============================================================================

/// Every configuration key the engine reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    DelayToleranceDays,
    HighDelayDays,
    VarianceThresholdPercent,
    HighVarianceThresholdPercent,
    InvoiceReminderDays,
    InvoicePmEscalationDays,
    InvoiceFinanceEscalationDays,
    ChangeOrderReminderDays,
    ChangeOrderExecutiveEscalationDays,
    MilestoneReminderDays,
    MilestoneExecutiveEscalationDays,
    ConflictDigestEnabled,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 12] = [
        ConfigKey::DelayToleranceDays,
        ConfigKey::HighDelayDays,
        ConfigKey::VarianceThresholdPercent,
        ConfigKey::HighVarianceThresholdPercent,
        ConfigKey::InvoiceReminderDays,
        ConfigKey::InvoicePmEscalationDays,
        ConfigKey::InvoiceFinanceEscalationDays,
        ConfigKey::ChangeOrderReminderDays,
        ConfigKey::ChangeOrderExecutiveEscalationDays,
        ConfigKey::MilestoneReminderDays,
        ConfigKey::MilestoneExecutiveEscalationDays,
        ConfigKey::ConflictDigestEnabled,
    ];

    /// Storage key string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::DelayToleranceDays => "delay_tolerance_days",
            ConfigKey::HighDelayDays => "high_delay_days",
            ConfigKey::VarianceThresholdPercent => "variance_threshold_percent",
            ConfigKey::HighVarianceThresholdPercent => "high_variance_threshold_percent",
            ConfigKey::InvoiceReminderDays => "invoice_reminder_days",
            ConfigKey::InvoicePmEscalationDays => "invoice_pm_escalation_days",
            ConfigKey::InvoiceFinanceEscalationDays => "invoice_finance_escalation_days",
            ConfigKey::ChangeOrderReminderDays => "change_order_reminder_days",
            ConfigKey::ChangeOrderExecutiveEscalationDays => "change_order_executive_escalation_days",
            ConfigKey::MilestoneReminderDays => "milestone_reminder_days",
            ConfigKey::MilestoneExecutiveEscalationDays => "milestone_executive_escalation_days",
            ConfigKey::ConflictDigestEnabled => "conflict_digest_enabled",
        }
    }

    /// Hard-coded fallback used when no row is stored.
    pub fn default_value(&self) -> ConfigValue {
        match self {
            ConfigKey::DelayToleranceDays => ConfigValue::Number(2.0),
            ConfigKey::HighDelayDays => ConfigValue::Number(5.0),
            ConfigKey::VarianceThresholdPercent => ConfigValue::Number(5.0),
            ConfigKey::HighVarianceThresholdPercent => ConfigValue::Number(10.0),
            ConfigKey::InvoiceReminderDays => ConfigValue::Number(1.0),
            ConfigKey::InvoicePmEscalationDays => ConfigValue::Number(7.0),
            ConfigKey::InvoiceFinanceEscalationDays => ConfigValue::Number(14.0),
            ConfigKey::ChangeOrderReminderDays => ConfigValue::Number(3.0),
            ConfigKey::ChangeOrderExecutiveEscalationDays => ConfigValue::Number(7.0),
            ConfigKey::MilestoneReminderDays => ConfigValue::Number(2.0),
            ConfigKey::MilestoneExecutiveEscalationDays => ConfigValue::Number(5.0),
            ConfigKey::ConflictDigestEnabled => ConfigValue::Bool(true),
        }
    }

    pub fn kind(&self) -> ConfigValueKind {
        self.default_value().kind()
    }

    pub fn description(&self) -> &'static str {
        match self {
            ConfigKey::DelayToleranceDays => "Days past ROS tolerated before a delay conflict is raised",
            ConfigKey::HighDelayDays => "Days past ROS above which a delay conflict is HIGH",
            ConfigKey::VarianceThresholdPercent => "Quantity variance percent tolerated on delivery",
            ConfigKey::HighVarianceThresholdPercent => "Quantity variance percent above which a conflict is HIGH",
            ConfigKey::InvoiceReminderDays => "Days overdue before an invoice reminder",
            ConfigKey::InvoicePmEscalationDays => "Days overdue before an invoice escalates to the PM",
            ConfigKey::InvoiceFinanceEscalationDays => "Days overdue before an invoice escalates to finance",
            ConfigKey::ChangeOrderReminderDays => "Days pending before a change order reminder",
            ConfigKey::ChangeOrderExecutiveEscalationDays => "Days pending before a change order escalates to executives",
            ConfigKey::MilestoneReminderDays => "Days unvalidated before a milestone reminder",
            ConfigKey::MilestoneExecutiveEscalationDays => "Days unvalidated before a milestone escalates to executives",
            ConfigKey::ConflictDigestEnabled => "Send the daily low/medium conflict digest",
        }
    }

    /// Check a candidate value against the key's static type and range.
    pub fn validate(&self, value: &ConfigValue) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: self.as_str().to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        match self.kind() {
            ConfigValueKind::Bool => bool::from_config_value(value)
                .map(|_| ())
                .ok_or_else(|| invalid("expected a boolean")),
            ConfigValueKind::Number => match f64::from_config_value(value) {
                Some(n) if n >= 0.0 => Ok(()),
                Some(_) => Err(invalid("must not be negative")),
                None => Err(invalid("expected a finite number")),
            },
            ConfigValueKind::Text => Ok(()),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| ConfigError::UnknownKey { key: s.to_string() })
    }
}

/// One stored configuration row. `organization_id = None` marks a global default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfigEntry {
    pub organization_id: Option<OrganizationId>,
    pub key: String,
    pub value: ConfigValue,
    pub description: Option<String>,
    pub updated_at: Timestamp,
}

/// Effective value: the override when present, the default otherwise.
pub fn resolve<T>(override_value: Option<T>, default: T) -> T {
    override_value.unwrap_or(default)
}

// ============================================================================
// THRESHOLD SETS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayThresholds {
    pub tolerance_days: i64,
    pub high_delay_days: i64,
}

impl Default for DelayThresholds {
    fn default() -> Self {
        Self {
            tolerance_days: 2,
            high_delay_days: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceThresholds {
    pub variance_percent: f64,
    pub high_variance_percent: f64,
}

impl Default for VarianceThresholds {
    fn default() -> Self {
        Self {
            variance_percent: 5.0,
            high_variance_percent: 10.0,
        }
    }
}

/// Ordered day thresholds mapping elapsed days to an escalation level.
///
/// A step is reached once `elapsed_days >= days`; the highest reached step wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationLadder {
    steps: Vec<(i64, EscalationLevel)>,
}

impl EscalationLadder {
    /// Build a ladder. Steps are sorted by level; a higher level never
    /// triggers earlier than a lower one.
    pub fn new(steps: impl IntoIterator<Item = (i64, EscalationLevel)>) -> Self {
        let mut steps: Vec<_> = steps
            .into_iter()
            .filter(|(_, level)| *level != EscalationLevel::None)
            .collect();
        steps.sort_by_key(|(_, level)| *level);
        let mut floor = 0;
        for (days, _) in steps.iter_mut() {
            *days = (*days).max(floor);
            floor = *days;
        }
        Self { steps }
    }

    /// Level reached after `elapsed_days`.
    pub fn level_for(&self, elapsed_days: i64) -> EscalationLevel {
        self.steps
            .iter()
            .rev()
            .find(|(days, _)| elapsed_days >= *days)
            .map(|(_, level)| *level)
            .unwrap_or(EscalationLevel::None)
    }
}

// ============================================================================
// THRESHOLD CONFIG
// ============================================================================

/// Effective configuration for one organization.
///
/// Resolution order per key: organization row, global row, hard default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdConfig {
    organization_id: Option<OrganizationId>,
    overrides: HashMap<String, ConfigValue>,
    globals: HashMap<String, ConfigValue>,
}

impl ThresholdConfig {
    /// Configuration with no stored rows; every read yields the hard default.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Build from stored rows. Rows for other organizations are ignored.
    pub fn from_entries(
        organization_id: Option<OrganizationId>,
        entries: impl IntoIterator<Item = ThresholdConfigEntry>,
    ) -> Self {
        let mut config = Self {
            organization_id,
            ..Self::default()
        };
        for entry in entries {
            match entry.organization_id {
                None => {
                    config.globals.insert(entry.key, entry.value);
                }
                Some(org) if Some(org) == organization_id => {
                    config.overrides.insert(entry.key, entry.value);
                }
                Some(_) => {}
            }
        }
        config
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    /// Set an organization override after validating it against the registry.
    pub fn set(&mut self, key: ConfigKey, value: ConfigValue) -> Result<(), ConfigError> {
        key.validate(&value)?;
        self.overrides.insert(key.as_str().to_string(), value);
        Ok(())
    }

    /// Stored value converted to `T`, or `None` when absent or of the wrong type.
    ///
    /// An organization row that fails conversion falls through to the global row.
    pub fn get_typed<T: FromConfigValue>(&self, key: &str) -> Option<T> {
        self.overrides
            .get(key)
            .and_then(T::from_config_value)
            .or_else(|| self.globals.get(key).and_then(T::from_config_value))
    }

    /// Whole-day count for a registered key; negative values fall back to the default.
    pub fn days(&self, key: ConfigKey) -> i64 {
        let default = i64::from_config_value(&key.default_value()).unwrap_or(0);
        resolve(
            self.get_typed::<f64>(key.as_str())
                .filter(|n| *n >= 0.0)
                .map(|n| n.floor() as i64),
            default,
        )
    }

    /// Percentage for a registered key; negative values fall back to the default.
    pub fn percent(&self, key: ConfigKey) -> f64 {
        let default = f64::from_config_value(&key.default_value()).unwrap_or(0.0);
        resolve(
            self.get_typed::<f64>(key.as_str()).filter(|n| *n >= 0.0),
            default,
        )
    }

    pub fn flag(&self, key: ConfigKey) -> bool {
        let default = bool::from_config_value(&key.default_value()).unwrap_or(false);
        resolve(self.get_typed::<bool>(key.as_str()), default)
    }

    /// Delay tolerance and HIGH cut-off (defaults 2 / 5 days).
    ///
    /// A HIGH cut-off below the tolerance is raised to the tolerance.
    pub fn delay_thresholds(&self) -> DelayThresholds {
        let tolerance_days = self.days(ConfigKey::DelayToleranceDays);
        let high_delay_days = self.days(ConfigKey::HighDelayDays).max(tolerance_days);
        DelayThresholds {
            tolerance_days,
            high_delay_days,
        }
    }

    /// Variance tolerance and HIGH cut-off in percent (defaults 5 / 10).
    pub fn variance_thresholds(&self) -> VarianceThresholds {
        let variance_percent = self.percent(ConfigKey::VarianceThresholdPercent);
        let high_variance_percent = self
            .percent(ConfigKey::HighVarianceThresholdPercent)
            .max(variance_percent);
        VarianceThresholds {
            variance_percent,
            high_variance_percent,
        }
    }

    /// Overdue invoices: reminder, PM, finance (defaults 1 / 7 / 14 days).
    pub fn invoice_ladder(&self) -> EscalationLadder {
        EscalationLadder::new([
            (self.days(ConfigKey::InvoiceReminderDays), EscalationLevel::Reminder),
            (self.days(ConfigKey::InvoicePmEscalationDays), EscalationLevel::Pm),
            (self.days(ConfigKey::InvoiceFinanceEscalationDays), EscalationLevel::Finance),
        ])
    }

    /// Pending change orders: reminder, executive (defaults 3 / 7 days).
    pub fn change_order_ladder(&self) -> EscalationLadder {
        EscalationLadder::new([
            (self.days(ConfigKey::ChangeOrderReminderDays), EscalationLevel::Reminder),
            (
                self.days(ConfigKey::ChangeOrderExecutiveEscalationDays),
                EscalationLevel::Executive,
            ),
        ])
    }

    /// Unvalidated milestones: reminder, executive (defaults 2 / 5 days).
    pub fn milestone_ladder(&self) -> EscalationLadder {
        EscalationLadder::new([
            (self.days(ConfigKey::MilestoneReminderDays), EscalationLevel::Reminder),
            (
                self.days(ConfigKey::MilestoneExecutiveEscalationDays),
                EscalationLevel::Executive,
            ),
        ])
    }

    pub fn digest_enabled(&self) -> bool {
        self.flag(ConfigKey::ConflictDigestEnabled)
    }
}
