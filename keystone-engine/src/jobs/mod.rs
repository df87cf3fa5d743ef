//! Background jobs for the Keystone engine
//!
//! - `scheduler`: runs the escalation scans and the daily conflict digest on
//!   fixed intervals until shutdown
//!
//! # Usage
//!
//! ```ignore
//! use keystone_engine::jobs::{conflict_jobs_task, JobConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(conflict_jobs_task(store, mailer, JobConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

pub mod scheduler;

pub use scheduler::{conflict_jobs_task, JobConfig, JobMetrics, JobMetricsSnapshot};
