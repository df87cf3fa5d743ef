//! Digest mailer implementations.
//!
//! `HttpMailer` posts each digest as JSON to a mail relay; `TracingMailer`
//! only logs, for dry runs and environments without a relay.

use crate::constants::{DEFAULT_MAILER_TIMEOUT_SECS, MAILER_USER_AGENT};
use async_trait::async_trait;
use keystone_core::{
    ConfigError, DigestMailer, NotificationError, OrganizationId, UserDigest, UserId,
};
use serde::Serialize;
use std::time::Duration;

/// Mail relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailerConfig {
    /// Relay endpoint; `None` selects the logging mailer.
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(DEFAULT_MAILER_TIMEOUT_SECS),
        }
    }
}

impl MailerConfig {
    /// Load from `KEYSTONE_MAILER_URL` and `KEYSTONE_MAILER_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let url = std::env::var("KEYSTONE_MAILER_URL")
            .ok()
            .filter(|u| !u.trim().is_empty());
        let timeout_secs = std::env::var("KEYSTONE_MAILER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAILER_TIMEOUT_SECS);
        Self {
            url,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Build the mailer this configuration selects.
    pub fn build(&self) -> Result<Box<dyn DigestMailer>, ConfigError> {
        match &self.url {
            Some(url) => Ok(Box::new(HttpMailer::new(url.clone(), self.timeout)?)),
            None => Ok(Box::new(TracingMailer)),
        }
    }
}

/// JSON body sent to the relay.
#[derive(Debug, Serialize)]
struct DigestPayload<'a> {
    to: &'a str,
    name: &'a str,
    user_id: UserId,
    organization_id: OrganizationId,
    subject: String,
    body: String,
    conflict_count: usize,
}

impl<'a> From<&'a UserDigest> for DigestPayload<'a> {
    fn from(digest: &'a UserDigest) -> Self {
        Self {
            to: &digest.email,
            name: &digest.name,
            user_id: digest.user_id,
            organization_id: digest.organization_id,
            subject: digest.subject(),
            body: digest.render_summary(),
            conflict_count: digest.conflicts.len(),
        }
    }
}

/// Posts digests to an HTTP mail relay. One attempt per recipient.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    url: String,
}

impl HttpMailer {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "KEYSTONE_MAILER_URL".to_string(),
                value: url.clone(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DigestMailer for HttpMailer {
    async fn send_digest(&self, digest: &UserDigest) -> Result<(), NotificationError> {
        let send_failed = |reason: String| NotificationError::SendFailed {
            recipient: digest.email.clone(),
            reason,
        };

        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", MAILER_USER_AGENT)
            .json(&DigestPayload::from(digest))
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !response.status().is_success() {
            tracing::warn!(
                user_id = %digest.user_id,
                status = %response.status(),
                "Mail relay rejected digest"
            );
            return Err(send_failed(format!("relay returned {}", response.status())));
        }
        tracing::debug!(user_id = %digest.user_id, "Digest delivered to relay");
        Ok(())
    }
}

/// Logs digests instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMailer;

#[async_trait]
impl DigestMailer for TracingMailer {
    async fn send_digest(&self, digest: &UserDigest) -> Result<(), NotificationError> {
        tracing::info!(
            user_id = %digest.user_id,
            email = %digest.email,
            conflicts = digest.conflicts.len(),
            subject = %digest.subject(),
            "Conflict digest (not sent, no relay configured)"
        );
        Ok(())
    }
}
