//! Token request records and their status transitions
//!
//! Status only moves forward: `pending` -> `completed` | `expired`. Every
//! mutator checks the current status first, so a terminal record is never
//! touched again.

use chrono::{DateTime, Duration, Utc};
use relay_core::{DeviceId, Error, ExtensionId, Result, TokenRequestId, TokenStatus};
use serde::{Deserialize, Serialize};

/// Longest accepted domain
const MAX_DOMAIN_LEN: usize = 256;

/// One in-flight 2FA challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub id: TokenRequestId,
    pub extension_id: ExtensionId,
    /// Devices the request was addressed to (resolved from pairings at creation)
    pub device_ids: Vec<DeviceId>,
    /// Domain the extension wants a token for
    pub domain: String,
    pub status: TokenStatus,
    /// Token sent back by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRequest {
    /// Create a pending request
    pub fn new(extension_id: ExtensionId, device_ids: Vec<DeviceId>, domain: &str) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: TokenRequestId::new(),
            extension_id,
            device_ids,
            domain: validate_domain(domain)?,
            status: TokenStatus::Pending,
            token: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_addressed_to(&self, device_id: &DeviceId) -> bool {
        self.device_ids.contains(device_id)
    }

    /// Pending but older than the validity window
    pub fn is_overdue(&self, now: DateTime<Utc>, validity: Duration) -> bool {
        self.status == TokenStatus::Pending && now >= self.created_at + validity
    }

    /// Status as observed by readers: overdue pending requests read as expired
    pub fn effective_status(&self, now: DateTime<Utc>, validity: Duration) -> TokenStatus {
        if self.is_overdue(now, validity) {
            TokenStatus::Expired
        } else {
            self.status
        }
    }

    /// Move to `completed`, optionally recording the token
    pub fn complete(&mut self, token: Option<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Expired(self.id.to_string()));
        }
        self.status = TokenStatus::Completed;
        self.token = token;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `expired`; returns false when the request was already terminal
    pub fn expire(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TokenStatus::Expired;
        self.updated_at = Utc::now();
        true
    }

    /// Terminal and last touched before `cutoff`
    pub fn is_reapable(&self, cutoff: DateTime<Utc>) -> bool {
        self.status.is_terminal() && self.updated_at < cutoff
    }
}

/// Trim a domain and reject blank or oversized ones
pub fn validate_domain(domain: &str) -> Result<String> {
    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("domain must not be blank".into()));
    }
    if trimmed.len() > MAX_DOMAIN_LEN {
        return Err(Error::Validation(format!(
            "domain must be at most {} bytes",
            MAX_DOMAIN_LEN
        )));
    }
    Ok(trimmed.to_string())
}

/// Convert a std duration, saturating at a century
pub fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}
