//! Conflict Jobs Background Task
//!
//! Periodically runs the escalation scans and the conflict digest against
//! shared storage. Each run is a stateless invocation; failures inside a run
//! are counted and logged, never fatal to the loop.
//!
//! # Configuration
//!
//! ```rust
//! use keystone_engine::jobs::JobConfig;
//! use std::time::Duration;
//!
//! let config = JobConfig {
//!     escalation_interval: Duration::from_secs(3600), // Hourly scans
//!     digest_interval: Duration::from_secs(86400),    // Daily digest
//!     log_results: true,
//! };
//! ```

use crate::constants::{DEFAULT_DIGEST_INTERVAL_SECS, DEFAULT_ESCALATION_INTERVAL_SECS};
use crate::digest::run_conflict_digest;
use crate::escalation::run_all_escalations;
use chrono::Utc;
use keystone_core::DigestMailer;
use keystone_storage::Storage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the conflict jobs task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// How often to run the escalation scans (default: 1 hour)
    pub escalation_interval: Duration,

    /// How often to send the conflict digest (default: 24 hours)
    pub digest_interval: Duration,

    /// Whether to log every run's counters at info level (default: true)
    pub log_results: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            escalation_interval: Duration::from_secs(DEFAULT_ESCALATION_INTERVAL_SECS),
            digest_interval: Duration::from_secs(DEFAULT_DIGEST_INTERVAL_SECS),
            log_results: true,
        }
    }
}

impl JobConfig {
    /// Create JobConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `KEYSTONE_ESCALATION_INTERVAL_SECS`: Escalation scan interval (default: 3600)
    /// - `KEYSTONE_DIGEST_INTERVAL_SECS`: Digest interval (default: 86400)
    /// - `KEYSTONE_JOB_LOG_RESULTS`: Whether to log run results (default: true)
    pub fn from_env() -> Self {
        let escalation_interval = Duration::from_secs(
            std::env::var("KEYSTONE_ESCALATION_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_ESCALATION_INTERVAL_SECS),
        );

        let digest_interval = Duration::from_secs(
            std::env::var("KEYSTONE_DIGEST_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_DIGEST_INTERVAL_SECS),
        );

        let log_results = std::env::var("KEYSTONE_JOB_LOG_RESULTS")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            escalation_interval,
            digest_interval,
            log_results,
        }
    }

    /// Short intervals for local runs.
    pub fn development() -> Self {
        Self {
            escalation_interval: Duration::from_secs(60),
            digest_interval: Duration::from_secs(300),
            log_results: true,
        }
    }

    pub fn production() -> Self {
        Self {
            log_results: false,
            ..Self::default()
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the conflict jobs task.
#[derive(Debug, Default)]
pub struct JobMetrics {
    /// Escalation runs completed
    pub escalation_runs: AtomicU64,

    /// Escalation notifications recorded (reminders and escalations)
    pub notifications_sent: AtomicU64,

    /// Digest runs completed
    pub digest_runs: AtomicU64,

    /// Digest emails handed to the mailer successfully
    pub digests_sent: AtomicU64,

    /// Per-entity and per-recipient failures across all runs
    pub errors: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            escalation_runs: self.escalation_runs.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
            digest_runs: self.digest_runs.load(Ordering::Relaxed),
            digests_sent: self.digests_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of job metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobMetricsSnapshot {
    pub escalation_runs: u64,
    pub notifications_sent: u64,
    pub digest_runs: u64,
    pub digests_sent: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run escalation scans and digests on their intervals until shutdown.
///
/// Both intervals tick immediately on start, so a fresh daemon performs one
/// escalation run and one digest run right away.
pub async fn conflict_jobs_task<S>(
    store: Arc<S>,
    mailer: Arc<dyn DigestMailer>,
    config: JobConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<JobMetrics>
where
    S: Storage + ?Sized,
{
    let metrics = Arc::new(JobMetrics::new());

    let mut escalation_interval = interval(config.escalation_interval);
    escalation_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut digest_interval = interval(config.digest_interval);
    digest_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        escalation_interval_secs = config.escalation_interval.as_secs(),
        digest_interval_secs = config.digest_interval.as_secs(),
        "Conflict jobs task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Conflict jobs task shutting down");
                    break;
                }
            }

            _ = escalation_interval.tick() => {
                escalation_cycle(store.as_ref(), &config, &metrics).await;
            }

            _ = digest_interval.tick() => {
                digest_cycle(store.as_ref(), mailer.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        escalation_runs = snapshot.escalation_runs,
        notifications_sent = snapshot.notifications_sent,
        digest_runs = snapshot.digest_runs,
        digests_sent = snapshot.digests_sent,
        errors = snapshot.errors,
        "Conflict jobs task completed"
    );

    metrics
}

async fn escalation_cycle<S: Storage + ?Sized>(store: &S, config: &JobConfig, metrics: &JobMetrics) {
    let summary = run_all_escalations(store, Utc::now()).await;
    metrics.escalation_runs.fetch_add(1, Ordering::Relaxed);
    metrics
        .notifications_sent
        .fetch_add(summary.total_reminders() + summary.total_escalations(), Ordering::Relaxed);
    metrics
        .errors
        .fetch_add(summary.total_errors() as u64, Ordering::Relaxed);

    if config.log_results {
        tracing::info!(
            processed = summary.total_processed(),
            reminders = summary.total_reminders(),
            escalations = summary.total_escalations(),
            errors = summary.total_errors(),
            "Escalation run completed"
        );
    } else {
        tracing::trace!("Escalation run completed");
    }
}

async fn digest_cycle<S: Storage + ?Sized>(
    store: &S,
    mailer: &dyn DigestMailer,
    config: &JobConfig,
    metrics: &JobMetrics,
) {
    let result = run_conflict_digest(store, mailer, Utc::now()).await;
    metrics.digest_runs.fetch_add(1, Ordering::Relaxed);
    metrics
        .digests_sent
        .fetch_add(result.emails_sent, Ordering::Relaxed);
    metrics
        .errors
        .fetch_add(result.errors.len() as u64, Ordering::Relaxed);

    if !result.success {
        tracing::error!(errors = ?result.errors, "Digest run failed");
    } else if config.log_results {
        tracing::info!(
            recipients = result.recipient_count,
            conflicts = result.conflict_count,
            emails_sent = result.emails_sent,
            "Digest run completed"
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_storage::MockStorage;
    use keystone_test_utils::RecordingMailer;

    #[test]
    fn test_config_default() {
        let config = JobConfig::default();
        assert_eq!(
            config.escalation_interval,
            Duration::from_secs(DEFAULT_ESCALATION_INTERVAL_SECS)
        );
        assert_eq!(
            config.digest_interval,
            Duration::from_secs(DEFAULT_DIGEST_INTERVAL_SECS)
        );
        assert!(config.log_results);
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(JobConfig::development().escalation_interval, Duration::from_secs(60));
        let production = JobConfig::production();
        assert!(!production.log_results);
        assert_eq!(production.digest_interval, Duration::from_secs(DEFAULT_DIGEST_INTERVAL_SECS));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = JobMetrics::new();
        metrics.escalation_runs.store(4, Ordering::Relaxed);
        metrics.digests_sent.store(7, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.escalation_runs, 4);
        assert_eq!(snapshot.digests_sent, 7);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn test_task_runs_once_then_stops_on_shutdown() {
        let store = Arc::new(MockStorage::new());
        let mailer: Arc<dyn DigestMailer> = Arc::new(RecordingMailer::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(conflict_jobs_task(
            store,
            mailer,
            JobConfig::development(),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let snapshot = handle.await.unwrap().snapshot();
        assert_eq!(snapshot.escalation_runs, 1);
        assert_eq!(snapshot.digest_runs, 1);
        assert_eq!(snapshot.errors, 0);
    }
}
